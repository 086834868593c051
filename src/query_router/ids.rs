//! Query ID allocation and wire encoding.
//!
//! Two ID spaces are in use, chosen per bot: the primary (prefix-echoing)
//! bot uses the 62-character alphabet `[A-Za-z0-9]`, everything else uses a
//! 2-digit decimal ID. Both are modeled as a dense index `0..capacity`;
//! only [`IdSpace::encode`]/[`IdSpace::decode`] differ.

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpace {
    SixtyTwoChar,
    TwoDigit,
}

impl IdSpace {
    pub fn capacity(self) -> usize {
        match self {
            IdSpace::SixtyTwoChar => ALPHABET.len(),
            IdSpace::TwoDigit => 100,
        }
    }

    /// Renders an allocated index as the wire prefix for this space.
    pub fn encode(self, index: usize) -> String {
        match self {
            IdSpace::SixtyTwoChar => (ALPHABET[index] as char).to_string(),
            IdSpace::TwoDigit => format!("{index:02}"),
        }
    }

    /// Reads the leading prefix of `message` as an index in this space,
    /// returning the index and the remainder of the message.
    pub fn decode<'a>(self, message: &'a str) -> Option<(usize, &'a str)> {
        match self {
            IdSpace::SixtyTwoChar => {
                let c = message.chars().next()?;
                let index = ALPHABET.iter().position(|&b| b as char == c)?;
                Some((index, &message[c.len_utf8()..]))
            }
            IdSpace::TwoDigit => {
                if message.len() < 2 || !message.as_bytes()[..2].iter().all(u8::is_ascii_digit) {
                    return None;
                }
                let index: usize = message[..2].parse().ok()?;
                Some((index, &message[2..]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixty_two_char_round_trips() {
        let space = IdSpace::SixtyTwoChar;
        for i in [0, 1, 25, 26, 61] {
            let encoded = space.encode(i);
            let wire = format!("{encoded}hello");
            let (decoded, rest) = space.decode(&wire).unwrap();
            assert_eq!(decoded, i);
            assert_eq!(rest, "hello");
        }
    }

    #[test]
    fn two_digit_round_trips_and_zero_pads() {
        let space = IdSpace::TwoDigit;
        assert_eq!(space.encode(3), "03");
        let (decoded, rest) = space.decode("03rest").unwrap();
        assert_eq!(decoded, 3);
        assert_eq!(rest, "rest");
    }

    #[test]
    fn two_digit_rejects_non_numeric_prefix() {
        assert!(IdSpace::TwoDigit.decode("ab").is_none());
        assert!(IdSpace::TwoDigit.decode("1").is_none());
    }
}
