//! Wires the per-service managers together and runs them to completion.
//!
//! Grounded on the top-level construction in `main.rs`/`DCSSManager` of the
//! original bot: one shared [`UserStore`], one [`QueryRouter`], and the
//! per-service managers that feed it. [`SourceRegistry`] resolution is
//! circular with the managers themselves (a knowledge-bot reply needs to
//! find its way back to a WT game or TV channel that didn't exist yet when
//! the router was built), so the registry and the `ChatCommandEngine`
//! cross-dependencies are resolved through a settle-once handle instead of
//! back-references.

use crate::chat_command::{ChannelControl, ChatCommandEngine, SchedulerStatus};
use crate::chat_source::{ChatSource, ServiceKind, SourceIdent, SourceRegistry};
use crate::configuration::Settings;
use crate::errors::BeemError;
use crate::query_router::QueryRouter;
use crate::tv::TvManager;
use crate::user_store::UserStore;
use crate::wt::WTManager;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Resolves a [`SourceIdent`] by delegating to whichever manager owns that
/// service, once it exists.
#[derive(Default)]
struct CompositeRegistry {
    wt: OnceLock<Arc<WTManager>>,
    tv: OnceLock<Arc<TvManager>>,
}

impl SourceRegistry for CompositeRegistry {
    fn resolve(&self, ident: SourceIdent) -> Option<Arc<dyn ChatSource>> {
        match ident.service {
            ServiceKind::Webtiles => self.wt.get().and_then(|m| m.resolve(ident)),
            ServiceKind::Tv => self.tv.get().and_then(|m| m.resolve(ident)),
        }
    }
}

/// Hands [`ChatCommandEngine`]'s `status` command a `WTManager` it doesn't
/// exist yet when the engine is built.
#[derive(Default)]
struct StatusHandle(OnceLock<Arc<WTManager>>);

impl SchedulerStatus for StatusHandle {
    fn status_report(&self) -> String {
        match self.0.get() {
            Some(manager) => manager.status_report(),
            None => "Webtiles scheduler is not running.".to_string(),
        }
    }
}

/// Same idea for the `join`/`part` commands and `TvManager`.
#[derive(Default)]
struct ChannelControlHandle(OnceLock<Arc<TvManager>>);

impl ChannelControl for ChannelControlHandle {
    fn enqueue_join(&self, channel: &str) {
        if let Some(manager) = self.0.get() {
            manager.enqueue_join(channel);
        }
    }
    fn enqueue_part(&self, channel: &str) {
        if let Some(manager) = self.0.get() {
            manager.enqueue_part(channel);
        }
    }
}

/// Builds every manager, wires them to each other, and runs them until
/// `cancel` fires (from a signal handler or a fatal startup error).
pub async fn run(settings: Settings, cancel: CancellationToken) -> Result<(), BeemError> {
    let store = Arc::new(UserStore::load(&settings.db_file).await?);

    let registry: Arc<CompositeRegistry> = Arc::new(CompositeRegistry::default());
    let query_router = Arc::new(QueryRouter::new(
        settings.dcss,
        registry.clone() as Arc<dyn SourceRegistry>,
        cancel.clone(),
    )?);

    let status_handle = Arc::new(StatusHandle::default());
    let channel_control_handle = Arc::new(ChannelControlHandle::default());

    let wt_settings = settings.webtiles;
    let chat_command_wt = Arc::new(
        ChatCommandEngine::new(
            ServiceKind::Webtiles,
            wt_settings.username.clone(),
            wt_settings.help_text.clone(),
            wt_settings.admins.clone(),
            std::time::Duration::from_secs(wt_settings.command_period),
            wt_settings.command_limit,
            wt_settings.single_user_mode(),
            store.clone(),
        )
        .with_scheduler_status(status_handle.clone() as Arc<dyn SchedulerStatus>),
    );

    let tv_manager = match settings.twitch {
        Some(twitch_settings) => {
            let chat_command_tv = Arc::new(
                ChatCommandEngine::new(
                    ServiceKind::Tv,
                    twitch_settings.nick.clone(),
                    wt_settings.help_text.clone(),
                    twitch_settings.admins.clone(),
                    std::time::Duration::from_secs(wt_settings.command_period),
                    wt_settings.command_limit,
                    false,
                    store.clone(),
                )
                .with_channel_control(channel_control_handle.clone() as Arc<dyn ChannelControl>),
            );
            let manager = Arc::new(TvManager::new(
                twitch_settings,
                store.clone(),
                query_router.clone(),
                chat_command_tv,
                cancel.clone(),
            ));
            channel_control_handle.0.set(manager.clone()).ok();
            registry.tv.set(manager.clone()).ok();
            Some(manager)
        }
        None => None,
    };

    let wt_manager = Arc::new(WTManager::new(
        wt_settings,
        store.clone(),
        chat_command_wt,
        query_router.clone(),
        tv_manager.clone(),
        cancel.clone(),
    ));
    status_handle.0.set(wt_manager.clone()).ok();
    registry.wt.set(wt_manager.clone()).ok();

    info!("beem: all services wired, starting");

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(query_router.run()));
    tasks.push(tokio::spawn(wt_manager.run()));
    if let Some(tv) = tv_manager {
        let tv_for_queue = tv.clone();
        tasks.push(tokio::spawn(tv.run()));
        let cancel_for_queue = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                if cancel_for_queue.is_cancelled() {
                    return;
                }
                tv_for_queue.process_queue().await;
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    _ = cancel_for_queue.cancelled() => return,
                }
            }
        }));
    }

    cancel.cancelled().await;
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
