//! WebP conversion engine driving the external `cwebp` tool.
//!
//! A job produces up to twelve output variants: two size tiers, each
//! rendered with six quality settings chosen from the job's options.
//! The engine polls the cancellation events between variants and while
//! waiting on the tool, so batch switches and shutdown interrupt a job
//! at the next natural boundary.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use webpflow_protocol::{Event, FileOptions, ImageType, SizeType};

const VARIANT_COUNT: usize = 6;
const TOTAL_VARIANTS: usize = 12;
const MAX_RETRIES: u32 = 4;
const CWEBP_TIMEOUT: Duration = Duration::from_secs(120);
const WATCHDOG_POLL: Duration = Duration::from_millis(100);

/// One conversion request handed to the converter.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    pub options: FileOptions,
}

/// The conversion engine seam.
///
/// Implementations must poll both events at natural boundaries and
/// return promptly once either fires; a cancelled run returns whatever
/// it finished, which the caller then discards.
pub trait Converter: Send + Sync {
    fn convert(
        &self,
        request: &ConversionRequest,
        batch_switch: &Event,
        shutdown: &Event,
    ) -> Result<Vec<PathBuf>>;
}

#[derive(Debug, Error)]
#[error("cwebp failed (rc={returncode}): {stderr}")]
pub struct CwebpError {
    pub returncode: i32,
    pub stderr: String,
}

/// Production converter shelling out to `cwebp`.
pub struct CwebpConverter;

impl Converter for CwebpConverter {
    fn convert(
        &self,
        request: &ConversionRequest,
        batch_switch: &Event,
        shutdown: &Event,
    ) -> Result<Vec<PathBuf>> {
        let should_stop = || batch_switch.is_set() || shutdown.is_set();
        if should_stop() {
            return Ok(Vec::new());
        }

        let ext = request
            .input_file
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if !matches!(ext.as_str(), "jpg" | "jpeg" | "png") {
            bail!("unsupported input format: .{ext}");
        }

        let size_args = choose_sizes(&request.options);
        let variants = quality_variants(&request.options);
        let crop = crop_args(&request.options);
        fs::create_dir_all(&request.output_dir)
            .with_context(|| format!("failed to create {}", request.output_dir.display()))?;

        let size0 = size_args.first().cloned().unwrap_or_default();
        let size1 = size_args.get(1).cloned().unwrap_or_else(|| size0.clone());

        let mut outputs = Vec::new();
        let mut errors = Vec::new();
        for index in 0..TOTAL_VARIANTS {
            if should_stop() {
                break;
            }

            let size = if index < VARIANT_COUNT { &size0 } else { &size1 };
            let variant = &variants[index % VARIANT_COUNT];
            let output_path = request.output_dir.join(format!("{index}.webp"));

            let mut args = crop.clone();
            args.extend(size.iter().cloned());
            args.extend(variant.iter().cloned());

            match convert_with_retry(
                &request.input_file,
                &output_path,
                &args,
                MAX_RETRIES,
                CWEBP_TIMEOUT,
                &should_stop,
            ) {
                Ok(()) => {
                    if output_path.exists() {
                        outputs.push(output_path);
                    }
                }
                Err(e) => {
                    if should_stop() {
                        break;
                    }
                    warn!("Variant {} failed: {}", index, e);
                    errors.push(format!("variant {index}: {e}"));
                }
            }
        }

        if outputs.is_empty() && !should_stop() {
            bail!("all variants failed: {}", errors.join("; "));
        }

        info!("Conversion complete: {} files", outputs.len());
        Ok(outputs)
    }
}

fn resize(width: u32, height: u32) -> Vec<String> {
    vec![
        "-resize".to_string(),
        width.to_string(),
        height.to_string(),
    ]
}

fn size_presets(size_type: Option<SizeType>) -> &'static [u32] {
    match size_type {
        Some(SizeType::Banner) => &[1200, 1500, 1800],
        Some(SizeType::Content) => &[800, 1000, 1200, 1400],
        Some(SizeType::Thumbnail) => &[400, 500, 650, 800],
        Some(SizeType::Icon) => &[96, 128, 256],
        Some(SizeType::Other) | None => &[600, 800, 1000, 1200],
    }
}

/// Determine the output size tiers from the job's options.
fn choose_sizes(options: &FileOptions) -> Vec<Vec<String>> {
    if options.has_explicit_size() {
        let width = options.width.unwrap_or(0);
        let height = options.height.unwrap_or(0);
        return vec![resize(width, height)];
    }

    if options.image_type == ImageType::Graphic {
        return vec![resize(150, 0), resize(250, 0)];
    }

    let widths = size_presets(options.size_type);
    let chosen: Vec<u32> = if widths.len() >= 4 {
        widths[2..4].to_vec()
    } else {
        widths[widths.len() - 2..].to_vec()
    };
    vec![resize(chosen[0], 0), resize(chosen[1], 0)]
}

/// Crop box passthrough. Coordinates are source-pixel values; cwebp
/// applies the crop before any resize.
fn crop_args(options: &FileOptions) -> Vec<String> {
    if !options.has_crop() {
        return Vec::new();
    }
    vec![
        "-crop".to_string(),
        options.crop_top_x.unwrap_or(0).to_string(),
        options.crop_top_y.unwrap_or(0).to_string(),
        options.crop_w.unwrap_or(0).to_string(),
        options.crop_h.unwrap_or(0).to_string(),
    ]
}

fn to_args(table: &[&[&str]]) -> Vec<Vec<String>> {
    table
        .iter()
        .map(|row| row.iter().map(|s| s.to_string()).collect())
        .collect()
}

/// The six cwebp argument sets for one size tier.
fn quality_variants(options: &FileOptions) -> Vec<Vec<String>> {
    if options.lossless {
        return to_args(&[
            &["-lossless", "-m", "6", "-q", "100"],
            &["-lossless", "-z", "9"],
            &["-lossless", "-z", "6"],
            &["-near_lossless", "80"],
            &["-near_lossless", "60"],
            &["-near_lossless", "40"],
        ]);
    }

    if options.text_focus {
        return to_args(&[
            &["-preset", "text", "-lossless", "-m", "6", "-q", "100", "-alpha_q", "100", "-exact"],
            &["-preset", "text", "-lossless", "-z", "6", "-alpha_q", "100", "-exact"],
            &["-preset", "text", "-lossless", "-z", "9", "-alpha_q", "100", "-exact"],
            &["-preset", "text", "-near_lossless", "90", "-m", "6", "-alpha_q", "100"],
            &["-preset", "text", "-near_lossless", "70", "-m", "6", "-alpha_q", "100"],
            &["-preset", "text", "-m", "6", "-q", "94", "-alpha_q", "100", "-alpha_filter", "best"],
        ]);
    }

    match options.image_type {
        ImageType::Product => {
            // Text-heavy product shots get the gentlest sharpening.
            let sharpness = if options.has_text { "1" } else { "4" };
            to_args(&[
                &["-m", "6", "-q", "92", "-af", "-sharpness", sharpness],
                &["-preset", "picture", "-m", "6", "-q", "88", "-af"],
                &["-preset", "picture", "-m", "6", "-q", "86", "-af"],
                &["-preset", "picture", "-m", "6", "-q", "84", "-af"],
                &["-preset", "picture", "-m", "6", "-q", "82", "-af"],
                &["-preset", "picture", "-m", "6", "-q", "80", "-af"],
            ])
        }
        ImageType::Complex => to_args(&[
            &["-preset", "photo", "-m", "6", "-q", "96", "-af"],
            &["-preset", "photo", "-m", "6", "-q", "94", "-af"],
            &["-preset", "photo", "-m", "6", "-q", "92", "-af"],
            &["-preset", "photo", "-m", "6", "-q", "90", "-af"],
            &["-preset", "photo", "-m", "6", "-q", "85", "-af"],
            &["-preset", "photo", "-m", "6", "-q", "82", "-af"],
        ]),
        ImageType::Graphic => to_args(&[
            &["-preset", "drawing", "-lossless", "-m", "6", "-q", "100", "-alpha_q", "100", "-alpha_filter", "best", "-exact"],
            &["-preset", "drawing", "-lossless", "-z", "9", "-alpha_q", "100", "-alpha_filter", "best", "-exact"],
            &["-preset", "drawing", "-lossless", "-z", "6", "-alpha_q", "100", "-alpha_filter", "best", "-exact"],
            &["-preset", "drawing", "-near_lossless", "90", "-m", "6", "-alpha_q", "100"],
            &["-preset", "drawing", "-near_lossless", "75", "-m", "6", "-alpha_q", "100"],
            &["-preset", "drawing", "-near_lossless", "60", "-m", "6", "-alpha_q", "100"],
        ]),
        ImageType::Default => to_args(&[
            &["-lossless", "-m", "6", "-q", "100"],
            &["-preset", "photo", "-m", "6", "-q", "96", "-af"],
            &["-preset", "picture", "-m", "6", "-q", "90", "-af"],
            &["-preset", "photo", "-m", "6", "-q", "90"],
            &["-m", "6", "-q", "90", "-sns", "30", "-af"],
            &["-m", "6", "-q", "90", "-sns", "40"],
        ]),
    }
}

/// Run cwebp, killing it on timeout or cancellation.
///
/// Returns the exit code and captured stderr; a missing binary maps to
/// rc 127 and a timeout or cancellation to rc 124, mirroring shell
/// conventions.
fn run_cwebp(
    args: &[String],
    timeout: Duration,
    cancelled: &dyn Fn() -> bool,
) -> Result<(i32, String)> {
    let mut child = match Command::new("cwebp")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok((127, "cwebp not found. Install the webp package.".to_string()));
        }
        Err(e) => return Err(e).context("failed to spawn cwebp"),
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("failed to poll cwebp")? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Ok((status.code().unwrap_or(-1), stderr));
        }
        if cancelled() || Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok((124, format!("terminated after {:.0?}", timeout)));
        }
        thread::sleep(WATCHDOG_POLL);
    }
}

/// Retry-able failure: partition overflow shrinks the output and tries
/// again.
fn is_partition_overflow(stderr: &str) -> bool {
    stderr.contains("PARTITION0_OVERFLOW") || stderr.contains("Error code: 6")
}

fn is_timeout(returncode: i32) -> bool {
    returncode == 124
}

/// Scale the `-resize` arguments down. Returns None when the command
/// has no resize to shrink.
fn shrink_resize_args(cmd: &[String], scale: f64) -> Option<Vec<String>> {
    let index = cmd.iter().position(|arg| arg == "-resize")?;
    let width: u32 = cmd.get(index + 1)?.parse().ok()?;
    let height: u32 = cmd.get(index + 2)?.parse().ok()?;

    let mut cmd = cmd.to_vec();
    if width > 0 {
        cmd[index + 1] = (((width as f64) * scale).max(1.0) as u32).to_string();
    }
    if height > 0 {
        cmd[index + 2] = (((height as f64) * scale).max(1.0) as u32).to_string();
    }
    Some(cmd)
}

/// Convert one variant, retrying with a shrinking resize on partition
/// overflow or timeout.
fn convert_with_retry(
    input_path: &Path,
    output_path: &Path,
    cwebp_args: &[String],
    max_retries: u32,
    timeout: Duration,
    cancelled: &dyn Fn() -> bool,
) -> Result<()> {
    if !input_path.exists() {
        bail!("input file not found: {}", input_path.display());
    }

    let mut cmd: Vec<String> = vec![
        input_path.display().to_string(),
        "-o".to_string(),
        output_path.display().to_string(),
        "-mt".to_string(),
    ];
    cmd.extend(cwebp_args.iter().cloned());

    debug!("Running: cwebp {}", cmd.join(" "));
    let (mut returncode, mut stderr) = run_cwebp(&cmd, timeout, cancelled)?;
    if returncode == 0 {
        return Ok(());
    }
    if !is_partition_overflow(&stderr) && !is_timeout(returncode) {
        return Err(CwebpError { returncode, stderr }.into());
    }

    let mut retry_cmd = cmd;
    for attempt in 1..=max_retries {
        if cancelled() {
            return Err(CwebpError { returncode, stderr }.into());
        }
        let scale = 1.0 - (attempt as f64 * 0.1);
        let Some(next) = shrink_resize_args(&retry_cmd, scale) else {
            return Err(CwebpError { returncode, stderr }.into());
        };
        retry_cmd = next;

        info!("Retry {}/{} with scale {:.1}", attempt, max_retries, scale);
        let (rc, err) = run_cwebp(&retry_cmd, timeout, cancelled)?;
        if rc == 0 {
            return Ok(());
        }
        if !is_partition_overflow(&err) && !is_timeout(rc) {
            return Err(CwebpError {
                returncode: rc,
                stderr: err,
            }
            .into());
        }
        returncode = rc;
        stderr = err;
    }

    Err(CwebpError { returncode, stderr }.into())
}
