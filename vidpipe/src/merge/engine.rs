//! Merge engine: validation, method selection and the ffmpeg invocations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{Chapter, MergeConfig, MergeMethod, MergeResult};
use crate::media::{MediaDescriptor, MediaProbe, ProgressParser, ToolInvocation, ToolRunner};
use crate::utils::fs::{
    ensure_parent_dir, file_size, io_error, is_non_empty_file, make_absolute, remove_file_quiet,
};
use crate::{Error, Result};

/// Accepted bitrate drift between the first input and the output.
const BITRATE_TOLERANCE: f64 = 0.2;

/// Receives merge progress as a percentage.
pub type MergeProgress<'a> = &'a (dyn Fn(f64) + Send + Sync);

struct ValidInput {
    path: PathBuf,
    descriptor: MediaDescriptor,
}

pub struct MergeEngine {
    runner: Arc<dyn ToolRunner>,
    probe: Arc<dyn MediaProbe>,
    ffmpeg: PathBuf,
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        probe: Arc<dyn MediaProbe>,
        ffmpeg: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            probe,
            ffmpeg: ffmpeg.into(),
            config: MergeConfig::default(),
        }
    }

    /// Configuration used by the pipeline stages.
    pub fn with_config(mut self, config: MergeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge `inputs` into `output`.
    ///
    /// Inputs that are missing, empty, unprobeable or (with
    /// `require_homogeneous`) incompatible with the first valid input are
    /// excluded and reported in [`MergeResult::warnings`].
    pub async fn merge_segments(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        config: &MergeConfig,
        cancel: &CancellationToken,
        progress: Option<MergeProgress<'_>>,
    ) -> Result<MergeResult> {
        self.merge_validated(inputs, output, config, cancel, progress)
            .await
            .map(|(result, _)| result)
    }

    /// Merge whole episodes, sorted by file name, with one chapter each.
    pub async fn merge_episodes(
        &self,
        episodes: &[PathBuf],
        output: &Path,
        season_title: Option<&str>,
        config: &MergeConfig,
        cancel: &CancellationToken,
        progress: Option<MergeProgress<'_>>,
    ) -> Result<MergeResult> {
        let mut sorted = episodes.to_vec();
        sorted.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let (mut result, descriptors) = self
            .merge_validated(&sorted, output, config, cancel, progress)
            .await?;

        let mut offset = 0.0;
        result.chapters = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let title = match season_title {
                    Some(season) if !season.is_empty() => {
                        format!("{} - Episode {}", season, i + 1)
                    }
                    _ => format!("Episode {}", i + 1),
                };
                let chapter = Chapter {
                    title,
                    start_secs: offset,
                    end_secs: offset + d.duration_secs,
                };
                offset += d.duration_secs;
                chapter
            })
            .collect();

        info!(
            episodes = result.merged_count,
            chapters = result.chapters.len(),
            output = %result.output_path.display(),
            "Episodes merged"
        );
        Ok(result)
    }

    async fn merge_validated(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        config: &MergeConfig,
        cancel: &CancellationToken,
        progress: Option<MergeProgress<'_>>,
    ) -> Result<(MergeResult, Vec<MediaDescriptor>)> {
        if inputs.is_empty() {
            return Err(Error::merge("no inputs to merge"));
        }
        let started = Instant::now();

        let (valid, mut warnings) = self.validate(inputs, config, cancel).await;
        if valid.is_empty() {
            return Err(Error::merge(format!(
                "none of the {} inputs are valid: {}",
                inputs.len(),
                warnings.join("; ")
            )));
        }
        if valid.len() < inputs.len() {
            warn!(
                valid = valid.len(),
                total = inputs.len(),
                "Some merge inputs were excluded"
            );
        }

        ensure_parent_dir(output).await?;
        let method = choose_method(&valid);
        let total_duration: f64 = valid.iter().map(|v| v.descriptor.duration_secs).sum();
        info!(
            method = %method,
            inputs = valid.len(),
            output = %output.display(),
            "Merging"
        );

        match method {
            MergeMethod::FileCopy => {
                tokio::fs::copy(&valid[0].path, output)
                    .await
                    .map_err(|e| io_error("copying merge input", output, e))?;
            }
            MergeMethod::ConcatDemuxer => {
                let list = concat_list_path(output);
                tokio::fs::write(&list, concat_list(&valid))
                    .await
                    .map_err(|e| io_error("writing concat list", &list, e))?;
                let invocation = self.demuxer_invocation(&list, output, config);
                let run = self
                    .run_tool(&invocation, cancel, total_duration, progress)
                    .await;
                remove_file_quiet(&list).await;
                run?;
            }
            MergeMethod::ConcatFilter => {
                let paths: Vec<&Path> = valid.iter().map(|v| v.path.as_path()).collect();
                let invocation = self.filter_invocation(&paths, output, config);
                self.run_tool(&invocation, cancel, total_duration, progress)
                    .await?;
            }
        }

        if !is_non_empty_file(output).await {
            return Err(Error::merge(format!(
                "merge produced no output at {}",
                output.display()
            )));
        }
        if let Some(report) = progress {
            report(100.0);
        }

        let output_info = match self.probe.probe(output, cancel).await {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(error = %e, "Could not probe merge output");
                None
            }
        };

        let quality_consistent = if config.quality_check {
            match &output_info {
                Some(out) => match quality_mismatch(&valid[0].descriptor, out) {
                    Some(reason) => {
                        warnings.push(format!("quality check: {}", reason));
                        false
                    }
                    None => true,
                },
                None => false,
            }
        } else {
            true
        };

        let output_size = file_size(output).await.unwrap_or(0);
        let descriptors: Vec<MediaDescriptor> =
            valid.iter().map(|v| v.descriptor.clone()).collect();
        let merged_inputs: Vec<PathBuf> = valid.into_iter().map(|v| v.path).collect();

        if config.remove_inputs {
            for path in &merged_inputs {
                if path != output {
                    remove_file_quiet(path).await;
                }
            }
        }

        let result = MergeResult {
            output_path: output.to_path_buf(),
            merged_count: merged_inputs.len(),
            inputs: merged_inputs,
            total_duration_secs: total_duration,
            output_size_bytes: output_size,
            method,
            processing_secs: started.elapsed().as_secs_f64(),
            warnings,
            quality_consistent,
            chapters: Vec::new(),
            metadata: output_info.as_ref().map(output_metadata).unwrap_or_default(),
        };
        debug!(
            output_size,
            duration_secs = total_duration,
            quality_consistent,
            "Merge finished"
        );
        Ok((result, descriptors))
    }

    async fn validate(
        &self,
        inputs: &[PathBuf],
        config: &MergeConfig,
        cancel: &CancellationToken,
    ) -> (Vec<ValidInput>, Vec<String>) {
        let mut valid: Vec<ValidInput> = Vec::new();
        let mut warnings = Vec::new();

        for path in inputs {
            match file_size(path).await {
                None => {
                    warnings.push(format!("input not found: {}", path.display()));
                    continue;
                }
                Some(0) => {
                    warnings.push(format!("empty input: {}", path.display()));
                    continue;
                }
                Some(_) => {}
            }

            let descriptor = match self.probe.probe(path, cancel).await {
                Ok(d) if d.duration_secs > 0.0 => d,
                Ok(_) => {
                    warnings.push(format!("invalid duration: {}", path.display()));
                    continue;
                }
                Err(e) => {
                    warnings.push(format!("unreadable input {}: {}", path.display(), e));
                    continue;
                }
            };

            if config.require_homogeneous
                && let Some(reference) = valid.first()
                && let Some(reason) = descriptor.incompatibility(&reference.descriptor)
            {
                warn!(input = %path.display(), reason = %reason, "Excluding incompatible merge input");
                warnings.push(format!("excluded {}: {}", path.display(), reason));
                continue;
            }

            valid.push(ValidInput {
                path: path.clone(),
                descriptor,
            });
        }

        (valid, warnings)
    }

    async fn run_tool(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
        total_duration: f64,
        progress: Option<MergeProgress<'_>>,
    ) -> Result<()> {
        let mut parser = ProgressParser::new();
        let mut on_record = |line: &str| {
            if let Some(p) = parser.push(line)
                && let Some(report) = progress
                && let Some(percent) = p.percent_of(total_duration)
            {
                report(percent);
            }
        };

        let output = self
            .runner
            .run(invocation, cancel, Some(&mut on_record))
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                other => Error::merge(format!("{} failed: {}", invocation.program_name(), other)),
            })?;

        if !output.success() {
            return Err(Error::merge(format!(
                "{} failed: {}",
                invocation.program_name(),
                output.failure_summary()
            )));
        }
        Ok(())
    }

    pub fn demuxer_invocation(
        &self,
        list: &Path,
        output: &Path,
        config: &MergeConfig,
    ) -> ToolInvocation {
        let mut args = strings(&["-f", "concat", "-safe", "0", "-i"]);
        args.push(list.to_string_lossy().into_owned());
        args.extend(strings(&["-c", "copy", "-progress", "pipe:1", "-y"]));
        args.push(output.to_string_lossy().into_owned());
        ToolInvocation::new(&self.ffmpeg, args).with_timeout(config.timeout())
    }

    pub fn filter_invocation(
        &self,
        inputs: &[&Path],
        output: &Path,
        config: &MergeConfig,
    ) -> ToolInvocation {
        let mut args = Vec::with_capacity(inputs.len() * 2 + 20);
        for input in inputs {
            args.push("-i".to_string());
            args.push(input.to_string_lossy().into_owned());
        }
        args.push("-filter_complex".to_string());
        args.push(concat_filter_graph(inputs.len()));
        args.extend(strings(&[
            "-map", "[outv]", "-map", "[outa]", "-c:v", "libx264", "-c:a", "aac", "-preset",
            "medium", "-crf", "23", "-progress", "pipe:1", "-y",
        ]));
        args.push(output.to_string_lossy().into_owned());
        ToolInvocation::new(&self.ffmpeg, args).with_timeout(config.timeout())
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn choose_method(valid: &[ValidInput]) -> MergeMethod {
    if valid.len() == 1 {
        return MergeMethod::FileCopy;
    }
    let reference = &valid[0].descriptor;
    if valid[1..]
        .iter()
        .all(|v| v.descriptor.is_stream_compatible(reference))
    {
        MergeMethod::ConcatDemuxer
    } else {
        MergeMethod::ConcatFilter
    }
}

/// `[0:v][0:a][1:v][1:a]concat=n=2:v=1:a=1[outv][outa]`
pub fn concat_filter_graph(count: usize) -> String {
    let mut graph = String::new();
    for i in 0..count {
        graph.push_str(&format!("[{i}:v][{i}:a]"));
    }
    graph.push_str(&format!("concat=n={}:v=1:a=1[outv][outa]", count));
    graph
}

fn concat_list(inputs: &[ValidInput]) -> String {
    inputs
        .iter()
        .map(|v| {
            let abs = make_absolute(&v.path);
            let escaped = abs.to_string_lossy().replace('\'', r"'\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}

fn concat_list_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "merge".to_string());
    output.with_file_name(format!(".{}_concat.txt", stem))
}

/// Resolution and codec must match, bitrate may drift by 20%.
fn quality_mismatch(reference: &MediaDescriptor, output: &MediaDescriptor) -> Option<String> {
    if reference.resolution() != output.resolution() {
        return Some("output resolution differs from the first input".to_string());
    }
    if reference.video_codec != output.video_codec {
        return Some("output codec differs from the first input".to_string());
    }
    if let (Some(reference), Some(out)) = (reference.bitrate, output.bitrate)
        && reference > 0
    {
        let ratio = out as f64 / reference as f64;
        if !(1.0 - BITRATE_TOLERANCE..=1.0 + BITRATE_TOLERANCE).contains(&ratio) {
            return Some(format!("output bitrate is {:.0}% of the first input", ratio * 100.0));
        }
    }
    None
}

fn output_metadata(info: &MediaDescriptor) -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    meta.insert(
        "output_duration".to_string(),
        format!("{:.3}", info.duration_secs),
    );
    if let Some((w, h)) = info.resolution() {
        meta.insert("output_resolution".to_string(), format!("{}x{}", w, h));
    }
    if let Some(codec) = &info.video_codec {
        meta.insert("output_codec".to_string(), codec.clone());
    }
    if let Some(bitrate) = info.bitrate {
        meta.insert("output_bitrate".to_string(), bitrate.to_string());
    }
    meta
}
