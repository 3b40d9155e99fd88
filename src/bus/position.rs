//! Sorted feed position descriptors.

use std::fmt;
use std::str::FromStr;

/// Where an item sits relative to its neighbours after a sorted feed change.
///
/// Wire form is colon-delimited with the item on the empty side:
/// `begin:` (first), `:end` (last), `:<id>` (right before `<id>`),
/// `<id>:` (right after `<id>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Position {
    Begin,
    End,
    Before(String),
    After(String),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Begin => f.write_str("begin:"),
            Position::End => f.write_str(":end"),
            Position::Before(id) => write!(f, ":{}", id),
            Position::After(id) => write!(f, "{}:", id),
        }
    }
}

/// A descriptor with no colon on either end.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid position descriptor: '{0}'")]
pub struct InvalidPosition(pub String);

impl FromStr for Position {
    type Err = InvalidPosition;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "begin:" => Ok(Position::Begin),
            ":end" => Ok(Position::End),
            _ => {
                if let Some(id) = s.strip_prefix(':').filter(|id| !id.is_empty()) {
                    Ok(Position::Before(id.to_string()))
                } else if let Some(id) = s.strip_suffix(':').filter(|id| !id.is_empty()) {
                    Ok(Position::After(id.to_string()))
                } else {
                    Err(InvalidPosition(s.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_forms() {
        assert_eq!(Position::Begin.to_string(), "begin:");
        assert_eq!(Position::End.to_string(), ":end");
        assert_eq!(Position::Before("4".to_string()).to_string(), ":4");
        assert_eq!(Position::After("4".to_string()).to_string(), "4:");
    }

    #[test]
    fn test_parse() {
        assert_eq!("begin:".parse(), Ok(Position::Begin));
        assert_eq!(":end".parse(), Ok(Position::End));
        assert_eq!(":12".parse(), Ok(Position::Before("12".to_string())));
        assert_eq!("12:".parse(), Ok(Position::After("12".to_string())));
    }

    #[test]
    fn test_parse_rejects_bare_ids() {
        assert!("12".parse::<Position>().is_err());
        assert!(":".parse::<Position>().is_err());
        assert!("".parse::<Position>().is_err());
    }
}
