//! `n`, `n:m` and `*` message-set syntax shared by `FETCH`, `STORE` and
//! `SEARCH`'s sequence-number/UID arguments (spec §4.8).

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Number(u32),
    Star,
}

impl Endpoint {
    fn parse(token: &str) -> Result<Self> {
        if token == "*" {
            Ok(Endpoint::Star)
        } else {
            token
                .parse::<u32>()
                .map(Endpoint::Number)
                .map_err(|_| Error::MalformedMessageSet)
        }
    }

    fn resolve(self, max: u32) -> u32 {
        match self {
            Endpoint::Number(n) => n,
            Endpoint::Star => max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Span {
    start: Endpoint,
    end: Endpoint,
}

/// A parsed message set, e.g. `1:5,7,9:*`. Resolution against the current
/// highest sequence number/UID happens lazily via [`MessageSet::resolve`],
/// since `*` only gets meaning once the caller knows how many messages exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSet {
    spans: Vec<Span>,
}

impl MessageSet {
    pub fn parse(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Err(Error::MalformedMessageSet);
        }

        let mut spans = Vec::new();
        for part in text.split(',') {
            if part.is_empty() {
                return Err(Error::MalformedMessageSet);
            }
            let span = match part.split_once(':') {
                Some((start, end)) => Span {
                    start: Endpoint::parse(start)?,
                    end: Endpoint::parse(end)?,
                },
                None => {
                    let point = Endpoint::parse(part)?;
                    Span {
                        start: point,
                        end: point,
                    }
                }
            };
            spans.push(span);
        }
        Ok(MessageSet { spans })
    }

    /// Expands this set into a sorted, de-duplicated list of concrete numbers,
    /// given the current highest valid sequence number/UID (`*`'s value).
    pub fn resolve(&self, max: u32) -> Vec<u32> {
        let mut out = Vec::new();
        for span in &self.spans {
            let mut lo = span.start.resolve(max);
            let mut hi = span.end.resolve(max);
            if lo > hi {
                std::mem::swap(&mut lo, &mut hi);
            }
            out.extend(lo..=hi);
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_number() {
        let set = MessageSet::parse("3").unwrap();
        assert_eq!(set.resolve(10), vec![3]);
    }

    #[test]
    fn parses_range() {
        let set = MessageSet::parse("2:4").unwrap();
        assert_eq!(set.resolve(10), vec![2, 3, 4]);
    }

    #[test]
    fn parses_star_as_max() {
        let set = MessageSet::parse("5:*").unwrap();
        assert_eq!(set.resolve(7), vec![5, 6, 7]);
    }

    #[test]
    fn parses_comma_list_and_dedupes() {
        let set = MessageSet::parse("1,2:3,3").unwrap();
        assert_eq!(set.resolve(10), vec![1, 2, 3]);
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(MessageSet::parse("").is_err());
        assert!(MessageSet::parse("abc").is_err());
        assert!(MessageSet::parse("1:").is_err());
    }

    #[test]
    fn reversed_range_still_expands() {
        let set = MessageSet::parse("4:2").unwrap();
        assert_eq!(set.resolve(10), vec![2, 3, 4]);
    }
}
