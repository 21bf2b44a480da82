use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Read;

/// Downloads `url` into memory, reporting progress on stderr.
pub fn download_file_as_bytes(url: &str, message: &str) -> Result<Vec<u8>> {
    let mut response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("failed to download {url}"))?;

    let total = response.content_length().unwrap_or(0);
    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::with_template("{msg:>24} [{bar:40}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("=> "),
    );
    progress.set_message(message.to_string());

    let mut bytes = Vec::with_capacity(total as usize);
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = response
            .read(&mut buf)
            .with_context(|| format!("failed while reading {url}"))?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&buf[..n]);
        progress.inc(n as u64);
    }
    progress.finish_and_clear();
    Ok(bytes)
}
