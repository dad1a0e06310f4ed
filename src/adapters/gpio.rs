use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::adapters::command;
use crate::config::TriggerConfig;
use crate::core::hardware::DigitalIo;

const TIMEOUT: Duration = Duration::from_secs(2);

/// Trigger and busy lines through the libgpiod command-line tools.
pub struct GpioLines {
    chip: String,
    input: String,
    output: String,
}

impl GpioLines {
    pub fn new(config: &TriggerConfig) -> Self {
        Self {
            chip: config.gpio_chip.clone(),
            input: config.input_line.to_string(),
            output: config.output_line.to_string(),
        }
    }
}

fn parse_level(stdout: &str) -> Result<bool> {
    match stdout.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => bail!("unexpected gpioget output {other:?}"),
    }
}

#[async_trait]
impl DigitalIo for GpioLines {
    async fn read_input(&self) -> Result<bool> {
        let out = command::run("gpioget", &[&self.chip, &self.input], TIMEOUT).await?;
        if !out.success {
            bail!("gpioget {} {}: {}", self.chip, self.input, out.stderr.trim());
        }
        parse_level(&out.stdout)
    }

    async fn write_output(&self, level: bool) -> Result<()> {
        let assignment = format!("{}={}", self.output, u8::from(level));
        let out = command::run("gpioset", &[&self.chip, &assignment], TIMEOUT).await?;
        if !out.success {
            bail!("gpioset {} {assignment}: {}", self.chip, out.stderr.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert!(!parse_level("0\n").unwrap());
        assert!(parse_level("1").unwrap());
        assert!(parse_level("high").is_err());
    }
}
