use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::TriggerConfig;

/// Raw digital lines: one input for the trigger, one output for the busy
/// indicator. Levels are electrical; polarity is applied by [`IoLines`].
#[async_trait]
pub trait DigitalIo: Send + Sync {
    async fn read_input(&self) -> Result<bool>;

    async fn write_output(&self, level: bool) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Polarity {
    pub active_low: bool,
}

impl Polarity {
    pub fn is_active(self, level: bool) -> bool {
        level != self.active_low
    }

    pub fn level_for(self, active: bool) -> bool {
        active != self.active_low
    }
}

/// The trigger input and busy output with their configured polarity.
#[derive(Clone)]
pub struct IoLines {
    io: Arc<dyn DigitalIo>,
    input: Polarity,
    output: Polarity,
}

impl IoLines {
    pub fn new(io: Arc<dyn DigitalIo>, config: &TriggerConfig) -> Self {
        Self {
            io,
            input: Polarity {
                active_low: config.input_active_low,
            },
            output: Polarity {
                active_low: config.output_active_low,
            },
        }
    }

    pub async fn trigger_asserted(&self) -> Result<bool> {
        Ok(self.input.is_active(self.io.read_input().await?))
    }

    pub async fn set_busy(&self, busy: bool) -> Result<()> {
        self.io.write_output(self.output.level_for(busy)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Lines {
        input: bool,
        written: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl DigitalIo for Lines {
        async fn read_input(&self) -> Result<bool> {
            Ok(self.input)
        }

        async fn write_output(&self, level: bool) -> Result<()> {
            self.written.lock().unwrap().push(level);
            Ok(())
        }
    }

    #[test]
    fn active_low_inverts() {
        let p = Polarity { active_low: true };
        assert!(p.is_active(false));
        assert!(!p.is_active(true));
        assert!(!p.level_for(true));

        let p = Polarity { active_low: false };
        assert!(p.is_active(true));
        assert!(p.level_for(true));
    }

    #[tokio::test]
    async fn default_wiring_is_active_low_on_both_lines() {
        let raw = Arc::new(Lines {
            input: false,
            written: Mutex::new(Vec::new()),
        });
        let lines = IoLines::new(raw.clone(), &TriggerConfig::default());

        assert!(lines.trigger_asserted().await.unwrap());
        lines.set_busy(true).await.unwrap();
        lines.set_busy(false).await.unwrap();
        assert_eq!(*raw.written.lock().unwrap(), vec![false, true]);
    }
}
