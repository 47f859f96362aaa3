//! Merge invoker: concatenates staged inputs with ffmpeg.
//!
//! Two strategies, tried in order:
//! - stream copy through the concat demuxer, only when every input has the
//!   same container extension;
//! - re-encode through the `concat` filter (libx264/aac), with every input
//!   normalized to one canvas, frame rate and audio layout first.
//!
//! No codec probing happens up front. Input durations are read with
//! ffprobe only to turn ffmpeg's `-progress` output into a percentage. A
//! failed attempt removes its output.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::config::Settings;
use crate::core::utils::{format_file_size, tail_chars};
use crate::progress::{ProgressMeter, ProgressSink, Stage};
use crate::session::StagedInput;
use crate::storage::logs::OutputDescriptor;

/// Canvas every input is scaled/padded to before a re-encoding concat.
pub const REENCODE_WIDTH: u32 = 1280;
pub const REENCODE_HEIGHT: u32 = 720;
pub const REENCODE_FPS: u32 = 30;

const CONCAT_LIST: &str = "concat.txt";
const STDERR_TAIL_CHARS: usize = 1500;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("❌ Merge failed: {0}")]
    Failed(String),

    #[error("🛑 Merge cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    StreamCopy,
    Reencode,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::StreamCopy => "stream_copy",
            MergeStrategy::Reencode => "reencode",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedOutput {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    pub strategy: MergeStrategy,
}

impl MergedOutput {
    pub fn descriptor(&self) -> OutputDescriptor {
        OutputDescriptor {
            name: self.name.clone(),
            size_bytes: self.size_bytes,
            strategy: self.strategy.as_str().to_string(),
        }
    }
}

#[async_trait]
pub trait Merger: Send + Sync {
    /// Concatenates `inputs` in order into a new file inside `output_dir`.
    async fn merge(
        &self,
        inputs: &[StagedInput],
        output_dir: &Path,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<MergedOutput, MergeError>;
}

/// Output position from one line of `-progress` output, in microseconds.
/// `out_time_ms` is microseconds as well, despite its name.
pub fn progress_position(line: &str) -> Option<u64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.trim().parse().ok(),
        _ => None,
    }
}

pub struct FfmpegMerger {
    bin: String,
    ffprobe_bin: String,
    timeout: Duration,
    preset: String,
    crf: u8,
}

impl FfmpegMerger {
    pub fn new(bin: impl Into<String>, timeout: Duration, preset: impl Into<String>, crf: u8) -> Self {
        Self {
            bin: bin.into(),
            ffprobe_bin: "ffprobe".to_string(),
            timeout,
            preset: preset.into(),
            crf,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.ffmpeg_bin.clone(),
            settings.merge_timeout,
            settings.merge_preset.clone(),
            settings.merge_crf,
        )
        .with_ffprobe(settings.ffprobe_bin.clone())
    }

    #[must_use]
    pub fn with_ffprobe(mut self, ffprobe_bin: impl Into<String>) -> Self {
        self.ffprobe_bin = ffprobe_bin.into();
        self
    }

    async fn input_duration(&self, path: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
    }

    /// Summed input durations in microseconds; `None` if ffprobe can't read
    /// one of them.
    async fn total_duration(&self, inputs: &[StagedInput]) -> Option<u64> {
        let mut total = 0.0;
        for input in inputs {
            match self.input_duration(&input.path).await {
                Some(secs) => total += secs,
                None => {
                    log::debug!("No duration for {}, merge progress has no percentage", input.name);
                    return None;
                }
            }
        }
        Some((total * 1_000_000.0) as u64)
    }

    /// Check if ffmpeg is available
    pub async fn is_available(&self) -> bool {
        Command::new(&self.bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn stream_copy(
        &self,
        inputs: &[StagedInput],
        output: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
        total: Option<u64>,
        progress: &ProgressSink,
    ) -> Result<(), MergeError> {
        let list_path = output_dir.join(CONCAT_LIST);
        let mut list = String::new();
        for input in inputs {
            let absolute = fs_err::tokio::canonicalize(&input.path)
                .await
                .map_err(|e| MergeError::Failed(format!("missing input {}: {}", input.name, e)))?;
            list.push_str(&concat_list_line(&absolute));
            list.push('\n');
        }
        fs_err::tokio::write(&list_path, list)
            .await
            .map_err(|e| MergeError::Failed(e.to_string()))?;

        let result = self.run(concat_copy_args(&list_path, output), cancel, total, progress).await;
        let _ = fs_err::tokio::remove_file(&list_path).await;
        result
    }

    async fn run(
        &self,
        args: Vec<OsString>,
        cancel: &CancellationToken,
        total: Option<u64>,
        progress: &ProgressSink,
    ) -> Result<(), MergeError> {
        log::debug!("Running {} {:?}", self.bin, args);

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MergeError::Failed(format!("could not start {}: {}", self.bin, e)))?;

        let stderr = child.stderr.take();
        let stderr_text = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        });

        let stdout = child.stdout.take();
        let mut meter = ProgressMeter::new(Stage::Merging, total);
        let watched = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(update) = progress_position(&line).and_then(|at| meter.set(at)) {
                        progress.report(update);
                    }
                }
            }
            child.wait().await
        };

        // dropping the child kills it
        let waited = tokio::select! {
            _ = cancel.cancelled() => return Err(MergeError::Cancelled),
            res = tokio::time::timeout(self.timeout, watched) => res,
        };

        let status = match waited {
            Err(_) => {
                return Err(MergeError::Failed(format!(
                    "ffmpeg timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
            Ok(Err(e)) => return Err(MergeError::Failed(e.to_string())),
            Ok(Ok(status)) => status,
        };

        if status.success() {
            return Ok(());
        }
        let stderr = stderr_text.await.unwrap_or_default();
        log::error!("FFmpeg merge error ({}): {}", status, stderr.trim());
        let tail = tail_chars(stderr.trim(), STDERR_TAIL_CHARS);
        Err(MergeError::Failed(if tail.is_empty() {
            format!("ffmpeg exited with {}", status)
        } else {
            tail
        }))
    }
}

#[async_trait]
impl Merger for FfmpegMerger {
    async fn merge(
        &self,
        inputs: &[StagedInput],
        output_dir: &Path,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<MergedOutput, MergeError> {
        if inputs.len() < 2 {
            return Err(MergeError::Failed(format!("need at least 2 inputs, got {}", inputs.len())));
        }
        for input in inputs {
            if fs_err::tokio::metadata(&input.path).await.is_err() {
                return Err(MergeError::Failed(format!("missing input {}", input.name)));
            }
        }

        let total = self.total_duration(inputs).await;

        if let Some(ext) = common_extension(inputs) {
            let output = output_dir.join(format!("merged.{}", ext));
            match self.stream_copy(inputs, &output, output_dir, cancel, total, progress).await {
                Ok(()) => return finish(output, MergeStrategy::StreamCopy).await,
                Err(MergeError::Cancelled) => {
                    remove_quietly(&output).await;
                    return Err(MergeError::Cancelled);
                }
                Err(MergeError::Failed(reason)) => {
                    log::warn!("Stream-copy merge failed, falling back to re-encode: {}", reason);
                    remove_quietly(&output).await;
                }
            }
        }

        let output = output_dir.join("merged.mp4");
        let args = reencode_args(inputs, &output, &self.preset, self.crf);
        match self.run(args, cancel, total, progress).await {
            Ok(()) => finish(output, MergeStrategy::Reencode).await,
            Err(e) => {
                remove_quietly(&output).await;
                Err(e)
            }
        }
    }
}

async fn finish(path: PathBuf, strategy: MergeStrategy) -> Result<MergedOutput, MergeError> {
    let size_bytes = fs_err::tokio::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
    if size_bytes == 0 {
        remove_quietly(&path).await;
        return Err(MergeError::Failed("ffmpeg produced an empty output".to_string()));
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("merged.mp4")
        .to_string();
    log::info!(
        "🎬 Merged into {} ({}, {})",
        path.display(),
        format_file_size(size_bytes),
        strategy.as_str()
    );
    Ok(MergedOutput {
        path,
        name,
        size_bytes,
        strategy,
    })
}

async fn remove_quietly(path: &Path) {
    let _ = fs_err::tokio::remove_file(path).await;
}

/// The shared container extension, if all inputs have the same one.
pub fn common_extension(inputs: &[StagedInput]) -> Option<String> {
    let first = inputs.first()?.extension()?;
    inputs
        .iter()
        .all(|i| i.extension().as_deref() == Some(first.as_str()))
        .then_some(first)
}

/// One line of a concat demuxer list. Single quotes are closed, escaped and
/// reopened.
pub fn concat_list_line(path: &Path) -> String {
    format!("file '{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

pub fn concat_copy_args(list: &Path, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostats",
        "-progress",
        "pipe:1",
        "-f",
        "concat",
        "-safe",
        "0",
        "-i",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(list.as_os_str().to_owned());
    for arg in ["-c", "copy", "-movflags", "+faststart", "-y"] {
        args.push(arg.into());
    }
    args.push(output.as_os_str().to_owned());
    args
}

pub fn reencode_args(inputs: &[StagedInput], output: &Path, preset: &str, crf: u8) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostats", "-progress", "pipe:1"]
        .iter()
        .map(OsString::from)
        .collect();
    for input in inputs {
        args.push("-i".into());
        args.push(input.path.as_os_str().to_owned());
    }

    let mut filter = String::new();
    let mut streams = String::new();
    for i in 0..inputs.len() {
        filter.push_str(&format!(
            "[{i}:v:0]scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},format=yuv420p[v{i}];\
             [{i}:a:0]aresample=48000,aformat=channel_layouts=stereo[a{i}];",
            i = i,
            w = REENCODE_WIDTH,
            h = REENCODE_HEIGHT,
            fps = REENCODE_FPS
        ));
        streams.push_str(&format!("[v{i}][a{i}]", i = i));
    }
    filter.push_str(&format!("{}concat=n={}:v=1:a=1[outv][outa]", streams, inputs.len()));

    for arg in ["-filter_complex", filter.as_str(), "-map", "[outv]", "-map", "[outa]", "-c:v", "libx264"] {
        args.push(arg.into());
    }
    args.push("-preset".into());
    args.push(preset.into());
    args.push("-crf".into());
    args.push(crf.to_string().into());
    for arg in ["-c:a", "aac", "-b:a", "192k", "-movflags", "+faststart", "-y"] {
        args.push(arg.into());
    }
    args.push(output.as_os_str().to_owned());
    args
}
