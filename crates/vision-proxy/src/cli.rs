use std::time::Duration;

use anyhow::{Result, bail};
use caption_adapter::{CaptionConfig, ExecutionPolicy};
use clap::{ArgAction, Parser};
use clap::builder::BoolishValueParser;
use reqwest::Url;

use crate::proxy::{ProxyConfig, parse_addr, serve};

const DEFAULT_OCR_PROMPT: &str = "请详细描述这张图片的内容";

#[derive(Debug, Parser)]
#[command(
    name = "vision-proxy",
    about = "Lets text-only chat models read images by captioning them first"
)]
pub struct Cli {
    #[arg(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "PROXY_PORT", default_value_t = 8000)]
    port: u16,
    #[arg(
        long,
        env = "OCR_ENDPOINT",
        default_value = "http://localhost:8080/v1/chat/completions"
    )]
    ocr_endpoint: String,
    #[arg(long, env = "OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,
    #[arg(long = "ocr-model", env = "OCR_MODEL_NAME", default_value = "gpt-4-vision")]
    ocr_model: String,
    /// Caption all images of a request at once instead of one by one.
    #[arg(
        long,
        env = "OCR_PARALLEL",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    ocr_parallel: bool,
    #[arg(long, env = "OCR_PROMPT", default_value = DEFAULT_OCR_PROMPT)]
    ocr_prompt: String,
    #[arg(long, env = "OCR_MAX_TOKENS", default_value_t = 4096)]
    ocr_max_tokens: u32,
    #[arg(long = "ocr-timeout-secs", env = "OCR_TIMEOUT", default_value_t = 60)]
    ocr_timeout_secs: u64,
    #[arg(long = "upstream-timeout-secs", env = "UPSTREAM_TIMEOUT", default_value_t = 300)]
    upstream_timeout_secs: u64,
}

impl Cli {
    fn into_config(self) -> Result<ProxyConfig> {
        let bind_addr = if self.host.contains(':') && !self.host.starts_with('[') {
            parse_addr(&format!("[{}]:{}", self.host, self.port))?
        } else {
            parse_addr(&format!("{}:{}", self.host, self.port))?
        };

        let endpoint = Url::parse(&self.ocr_endpoint)
            .map_err(|e| anyhow::anyhow!("invalid OCR endpoint '{}': {e}", self.ocr_endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            bail!(
                "OCR endpoint must be http:// or https://, got '{}'",
                self.ocr_endpoint
            );
        }
        if self.ocr_timeout_secs == 0 || self.upstream_timeout_secs == 0 {
            bail!("timeouts must be at least one second");
        }

        Ok(ProxyConfig {
            bind_addr,
            caption: CaptionConfig {
                endpoint: self.ocr_endpoint,
                api_key: self.ocr_api_key.filter(|k| !k.trim().is_empty()),
                model: self.ocr_model,
                prompt: self.ocr_prompt,
                max_tokens: self.ocr_max_tokens,
                timeout: Duration::from_secs(self.ocr_timeout_secs),
                policy: ExecutionPolicy::from_parallel_flag(self.ocr_parallel),
            },
            upstream_timeout: Duration::from_secs(self.upstream_timeout_secs),
        })
    }
}

pub async fn run() -> Result<()> {
    let config = Cli::parse().into_config()?;
    serve(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("vision-proxy").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_build_config() {
        let config = parse(&[
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--ocr-endpoint",
            "https://ocr.internal/v1/chat/completions",
            "--ocr-api-key",
            "ocr-secret",
            "--ocr-model",
            "qwen-vl",
            "--ocr-parallel",
            "false",
            "--ocr-timeout-secs",
            "5",
            "--upstream-timeout-secs",
            "30",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.caption.model, "qwen-vl");
        assert_eq!(config.caption.api_key.as_deref(), Some("ocr-secret"));
        assert_eq!(config.caption.policy, ExecutionPolicy::Serial);
        assert_eq!(config.caption.timeout, Duration::from_secs(5));
        assert_eq!(config.upstream_timeout, Duration::from_secs(30));
    }

    #[test]
    fn ipv6_host_and_blank_key() {
        let config = parse(&["--host", "::1", "--ocr-api-key", "  "])
            .into_config()
            .unwrap();
        assert_eq!(config.bind_addr.to_string(), "[::1]:8000");
        assert!(config.caption.api_key.is_none());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(
            parse(&["--ocr-endpoint", "localhost:8080"])
                .into_config()
                .is_err()
        );
        assert!(parse(&["--ocr-timeout-secs", "0"]).into_config().is_err());
        assert!(parse(&["--host", "not an address"]).into_config().is_err());
    }
}
