//! Integration tests for the download, segment/encode and merge engines.
//!
//! Every external tool is replaced by an in-process fake.

mod support;

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use support::{CountingEncoder, FakeFfmpeg, ScriptedStrategy, TableProbe, arc_probe, clip};
use vidpipe::downloader::{
    DownloadOrchestrator, FetchOptions, FetchOutcome, NoopTransferSink, RetryConfig, SourceRef,
};
use vidpipe::config::PipelineConfig;
use vidpipe::merge::{MergeConfig, MergeEngine, MergeMethod};
use vidpipe::pipeline::{PipelineOrchestrator, PipelineRequest, RunStatus, SegmentedProcessor};
use vidpipe::processing::{
    EncodeSettings, NoopEncodeSink, ParallelEncoder, Segment, Segmenter, plan_segments,
};

mod download_tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_with_one_failing_source() {
        let dir = TempDir::new().expect("temp dir");
        let strategy = Arc::new(ScriptedStrategy::default());
        let orchestrator =
            DownloadOrchestrator::new(strategy.clone(), 8).with_retry(RetryConfig::none());

        let sources = vec![
            SourceRef::new("https://cdn.example.com/ep1.mp4", 1),
            SourceRef::new("https://cdn.example.com/fail.mp4", 2),
            SourceRef::new("https://cdn.example.com/ep3.mp4", 3),
        ];
        let report = orchestrator
            .fetch_many(
                &sources,
                dir.path(),
                Some(2),
                &FetchOptions::default(),
                Arc::new(NoopTransferSink),
            )
            .await
            .expect("batch should succeed partially");

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.success_count(), 2);
        let failures = report.failures(&sources);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 1);
        assert_eq!(failures[0].source, sources[1]);
        assert!(matches!(report.outcomes[0], FetchOutcome::Fetched { .. }));
        assert!(matches!(report.outcomes[2], FetchOutcome::Fetched { .. }));

        for path in report.fetched_paths() {
            assert!(path.exists(), "{} missing", path.display());
        }
        assert!(strategy.gauge.peak() <= 2, "peak was {}", strategy.gauge.peak());
        assert!(orchestrator.active_transfers().is_empty());
    }

    #[tokio::test]
    async fn test_batch_fails_when_everything_fails() {
        let dir = TempDir::new().expect("temp dir");
        let orchestrator = DownloadOrchestrator::new(Arc::new(ScriptedStrategy::default()), 2)
            .with_retry(RetryConfig::none());
        let sources = vec![
            SourceRef::new("https://a.example.com/fail1.mp4", 1),
            SourceRef::new("https://a.example.com/fail2.mp4", 2),
        ];
        let err = orchestrator
            .fetch_many(
                &sources,
                dir.path(),
                None,
                &FetchOptions::default(),
                Arc::new(NoopTransferSink),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, vidpipe::Error::Fetch { .. }));
    }
}

mod segment_tests {
    use super::*;

    #[test]
    fn test_plan_covers_source() {
        let plan = plan_segments(125.0, 60.0);
        let durations: Vec<f64> = plan.iter().map(|(_, d)| *d).collect();
        assert_eq!(durations, vec![60.0, 60.0, 5.0]);
        assert_eq!(plan[2].0, 120.0);
        assert_eq!(plan_segments(120.0, 60.0).len(), 2);
    }

    #[tokio::test]
    async fn test_segment_then_encode_survives_one_failure() {
        let dir = TempDir::new().expect("temp dir");
        let input = dir.path().join("source.mp4");
        tokio::fs::write(&input, b"source").await.unwrap();

        let probe = arc_probe(TableProbe::new(&[("source.mp4", clip(1920, 1080, 125.0))]));
        let runner = Arc::new(FakeFfmpeg::default());
        let segmenter = Segmenter::new(runner.clone(), probe, "ffmpeg");

        let segments = segmenter
            .segment(&input, 60, &dir.path().join("segments"), &CancellationToken::new())
            .await
            .expect("segmentation")
            .segments;
        assert_eq!(segments.len(), 3);
        let durations: Vec<f64> = segments.iter().map(|s| s.duration_secs).collect();
        assert_eq!(durations, vec![60.0, 60.0, 5.0]);
        assert_eq!(runner.calls.lock().len(), 3);

        let encoder = Arc::new(CountingEncoder {
            failing: vec![2],
            ..Default::default()
        });
        let parallel = ParallelEncoder::new(encoder.clone(), 2);
        let report = parallel
            .encode_parallel(
                &segments,
                &dir.path().join("encoded"),
                None,
                &EncodeSettings::default(),
                Arc::new(NoopEncodeSink),
                &CancellationToken::new(),
            )
            .await
            .expect("two segments should encode");

        assert_eq!(report.outputs.len(), 2);
        assert!(report.outputs[0].ends_with("processed_segment_0000.mp4"));
        assert!(report.outputs[1].ends_with("processed_segment_0001.mp4"));
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("segment 2 (120s-125s) was not encoded"));
    }

    #[tokio::test]
    async fn test_failed_cut_is_dropped() {
        let dir = TempDir::new().expect("temp dir");
        let input = dir.path().join("source.mp4");
        tokio::fs::write(&input, b"source").await.unwrap();

        let probe = arc_probe(TableProbe::new(&[("source.mp4", clip(1280, 720, 125.0))]));
        let runner = Arc::new(FakeFfmpeg {
            failing_starts: vec!["120".to_string()],
            ..Default::default()
        });
        let segmenter = Segmenter::new(runner, probe, "ffmpeg");
        let report = segmenter
            .segment(&input, 60, &dir.path().join("segments"), &CancellationToken::new())
            .await
            .expect("two cuts survive");
        assert_eq!(report.segments.len(), 2);
        assert_eq!(report.segments[1].index, 1);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_encode_concurrency_never_exceeds_limit() {
        let dir = TempDir::new().expect("temp dir");
        let segments: Vec<Segment> = (0..8)
            .map(|index| Segment {
                index,
                path: dir.path().join(Segment::file_name(index)),
                start_secs: index as f64 * 10.0,
                duration_secs: 10.0,
            })
            .collect();

        let encoder = Arc::new(CountingEncoder::default());
        let parallel = ParallelEncoder::new(encoder.clone(), 3);
        let outputs = parallel
            .encode_parallel(
                &segments,
                dir.path(),
                None,
                &EncodeSettings::default(),
                Arc::new(NoopEncodeSink),
                &CancellationToken::new(),
            )
            .await
            .expect("encode")
            .outputs;

        assert_eq!(outputs.len(), 8);
        let peak = encoder.gauge.peak();
        assert!(peak <= 3, "peak was {}", peak);
        assert!(peak >= 2, "segments never overlapped");
    }
}

mod merge_tests {
    use super::*;

    async fn write_inputs(dir: &TempDir, names: &[&str]) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for name in names {
            let path = dir.path().join(name);
            tokio::fs::write(&path, b"episode").await.unwrap();
            paths.push(path);
        }
        paths
    }

    #[tokio::test]
    async fn test_mismatched_resolution_degrades_to_copy() {
        let dir = TempDir::new().expect("temp dir");
        let inputs = write_inputs(&dir, &["a.mp4", "b.mp4"]).await;
        let probe = TableProbe::new(&[
            ("a.mp4", clip(1920, 1080, 100.0)),
            ("b.mp4", clip(1280, 720, 100.0)),
            ("merged.mp4", clip(1920, 1080, 100.0)),
        ]);
        let runner = Arc::new(FakeFfmpeg::default());
        let engine = MergeEngine::new(runner.clone(), arc_probe(probe), "ffmpeg");

        let result = engine
            .merge_segments(
                &inputs,
                &dir.path().join("merged.mp4"),
                &MergeConfig::default(),
                &CancellationToken::new(),
                None,
            )
            .await
            .expect("merge");

        assert_eq!(result.method, MergeMethod::FileCopy);
        assert_eq!(result.merged_count, 1);
        assert_eq!(result.inputs, vec![inputs[0].clone()]);
        assert!(result.warnings.iter().any(|w| w.contains("b.mp4")));
        assert!(runner.calls.lock().is_empty(), "copy must not run ffmpeg");
        assert!(result.quality_consistent);
    }

    #[tokio::test]
    async fn test_merge_metadata_is_stable_across_runs() {
        let dir = TempDir::new().expect("temp dir");
        let inputs = write_inputs(&dir, &["ep1.mp4", "ep2.mp4"]).await;
        let probe = TableProbe::new(&[
            ("ep1.mp4", clip(1920, 1080, 60.0)),
            ("ep2.mp4", clip(1920, 1080, 30.0)),
        ])
        .with_fallback(clip(1920, 1080, 90.0));
        let engine = MergeEngine::new(
            Arc::new(FakeFfmpeg::default()),
            arc_probe(probe),
            "ffmpeg",
        );

        let mut results = Vec::new();
        for name in ["first.mp4", "second.mp4"] {
            let result = engine
                .merge_episodes(
                    &inputs,
                    &dir.path().join(name),
                    Some("Season 1"),
                    &MergeConfig::default(),
                    &CancellationToken::new(),
                    None,
                )
                .await
                .expect("merge");
            results.push(result);
        }

        assert_eq!(results[0].method, MergeMethod::ConcatDemuxer);
        assert_eq!(results[0].metadata, results[1].metadata);
        assert_eq!(results[0].chapters, results[1].chapters);
        assert_eq!(results[0].total_duration_secs, 90.0);
        assert_eq!(results[0].chapters[1].title, "Season 1 - Episode 2");
        assert_eq!(results[0].chapters[1].start_secs, 60.0);
        for input in &inputs {
            assert!(input.exists(), "inputs are kept by default");
        }
    }
}

mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_segments_surface_as_run_warnings() {
        let dir = TempDir::new().expect("temp dir");
        let input = dir.path().join("feature.mp4");
        tokio::fs::write(&input, b"source").await.unwrap();

        let probe = arc_probe(
            TableProbe::new(&[("feature.mp4", clip(1920, 1080, 245.0))])
                .with_fallback(clip(1920, 1080, 60.0)),
        );
        let runner = Arc::new(FakeFfmpeg {
            failing_starts: vec!["120".to_string()],
            ..Default::default()
        });
        let encoder = Arc::new(CountingEncoder {
            failing: vec![3],
            ..Default::default()
        });
        let processor = SegmentedProcessor::new(
            Segmenter::new(runner.clone(), probe.clone(), "ffmpeg"),
            encoder.clone(),
            ParallelEncoder::new(encoder.clone(), 2),
            MergeEngine::new(runner.clone(), probe.clone(), "ffmpeg"),
        );
        let downloader = DownloadOrchestrator::new(Arc::new(ScriptedStrategy::default()), 2);
        let merger = MergeEngine::new(runner, probe, "ffmpeg");

        let config = PipelineConfig {
            temp_dir: dir.path().join("tmp"),
            output_dir: dir.path().join("out"),
            ..Default::default()
        };
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(downloader),
            Arc::new(processor),
            Arc::new(merger),
            &config,
        );

        let mut request = PipelineRequest::process(vec![input]);
        request.segment_duration_secs = 60;
        let report = orchestrator.run(request).await.expect("run");

        assert_eq!(report.status, RunStatus::Completed, "errors: {:?}", report.errors);
        assert_eq!(report.output_files.len(), 1);
        assert!(report.output_files[0].exists());

        let mut encoded = encoder.encoded.lock().clone();
        encoded.sort_unstable();
        assert_eq!(encoded, vec![0, 1, 4]);

        let has = |needle: &str| report.warnings.iter().any(|w| w.contains(needle));
        assert!(
            has("feature.mp4: segment 2 (120s-180s) was not cut"),
            "{:?}",
            report.warnings
        );
        assert!(
            has("feature.mp4: segment 3 (180s-240s) was not encoded"),
            "{:?}",
            report.warnings
        );
    }
}
