use std::sync::Arc;
use tiktoken_rs::CoreBPE;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u64;
}

/// `o200k_base` encoder; construction is expensive, so build once and share.
#[derive(Clone)]
pub struct TiktokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    pub fn o200k() -> Result<Self, String> {
        let bpe = tiktoken_rs::o200k_base().map_err(|err| err.to_string())?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_ordinary(text).len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_has_no_tokens() {
        let counter = TiktokenCounter::o200k().unwrap();
        assert_eq!(counter.count(""), 0);
    }

    #[test]
    fn counts_grow_with_text() {
        let counter = TiktokenCounter::o200k().unwrap();
        let short = counter.count("hello");
        let long = counter.count("hello there, this sentence is a fair bit longer");
        assert!(short >= 1);
        assert!(long > short);
    }
}
