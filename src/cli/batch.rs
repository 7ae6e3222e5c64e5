//! `convert2pdf batch`, `check` and `types`.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use crate::cli::{BatchArgs, ServerArgs};
use crate::client::{ClientConfig, ConvertClient, ProgressSink, ProgressSnapshot};
use crate::formats::family_of;

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

/// Terminal progress bar for batch runs.
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:40.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Converting");
        Self { bar }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for IndicatifProgress {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.enable_steady_tick(Duration::from_millis(80));
    }

    fn on_job_complete(&self, s: &ProgressSnapshot) {
        self.bar.set_position(s.done as u64);
        let current: String = s.current.chars().take(20).collect();
        self.bar.set_message(format!(
            "ok {}  failed {}  {}",
            s.succeeded, s.failed, current
        ));
    }

    fn on_batch_complete(&self, s: &ProgressSnapshot) {
        self.bar.finish_with_message(format!(
            "ok {}  failed {}",
            s.succeeded, s.failed
        ));
    }
}

fn client_config(server: &ServerArgs) -> ClientConfig {
    ClientConfig {
        host: server.host.clone(),
        port: server.port,
        timeout: Duration::from_secs(server.timeout),
        ..Default::default()
    }
}

/// Returns true iff every file converted.
pub(super) async fn run_batch(args: BatchArgs) -> anyhow::Result<bool> {
    let retry_delay = Duration::try_from_secs_f64(args.retry_delay)
        .context("--retry-delay must be a non-negative number of seconds")?;
    let config = ClientConfig {
        max_retries: args.retries,
        retry_delay,
        ..client_config(&args.server)
    };

    let client = ConvertClient::new(config)?.with_progress(Arc::new(IndicatifProgress::new()));
    client
        .connect()
        .await
        .with_context(|| format!("Cannot reach conversion server at {}", client.base_url()))?;

    let results = client
        .convert_directory(
            &args.input,
            args.output.as_deref(),
            args.workers as usize,
            args.recursive,
            !args.no_save_results,
        )
        .await?;

    if results.is_empty() {
        println!("No convertible files found in {}", args.input.display());
        return Ok(true);
    }

    let failed: Vec<_> = results.iter().filter(|r| !r.is_success()).collect();
    println!();
    println!(
        "Converted {}/{} files",
        results.len() - failed.len(),
        results.len()
    );
    for result in &failed {
        println!(
            "  FAILED {}: {}",
            result.original_file,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    Ok(failed.is_empty())
}

pub(super) async fn run_check(args: ServerArgs) -> anyhow::Result<ExitCode> {
    let client = ConvertClient::new(client_config(&args))?;
    match client.connect().await {
        Ok(()) => {
            println!(
                "Server {} is healthy, {} supported file types",
                client.base_url(),
                client.supported_types().len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("Server {} is not usable: {}", client.base_url(), e);
            Ok(ExitCode::FAILURE)
        }
    }
}

pub(super) async fn run_types(args: ServerArgs) -> anyhow::Result<()> {
    let client = ConvertClient::new(client_config(&args))?;
    client.connect().await?;

    let mut by_family: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for ext in client.supported_types() {
        let family = family_of(&ext).unwrap_or("other");
        let entry = by_family.entry(family).or_default();
        if !entry.contains(&ext) {
            entry.push(ext);
        }
    }

    println!("Supported file types ({}):", client.base_url());
    for (family, exts) in by_family {
        println!("  {:<13} {}", family, exts.join(" "));
    }
    Ok(())
}
