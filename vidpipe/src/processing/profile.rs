//! Compression profiles for the compress-only mode.

use serde::{Deserialize, Serialize};

use super::analysis::{ContentAnalysis, ContentComplexity};
use super::encoder::EncodeSettings;
use crate::hardware::{Preset, QualityTarget};

const MIN_CRF: u32 = 18;
const MAX_CRF: u32 = 28;

/// Speed versus size trade-off applied on top of [`EncodeSettings`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CompressionProfile {
    #[default]
    Balanced,
    Quality,
    Size,
    Speed,
}

impl CompressionProfile {
    pub fn preset(&self) -> Preset {
        match self {
            Self::Balanced => Preset::Medium,
            Self::Quality => Preset::Slow,
            Self::Size => Preset::Veryslow,
            Self::Speed => Preset::Veryfast,
        }
    }

    /// Constant-quality value derived from `base`, kept within 18..=28.
    pub fn crf(&self, base: u32) -> u32 {
        let base = base.clamp(MIN_CRF, MAX_CRF);
        match self {
            Self::Quality => base.saturating_sub(2).max(MIN_CRF),
            Self::Size => (base + 3).min(MAX_CRF),
            Self::Balanced | Self::Speed => base,
        }
    }

    /// Settings with this profile's preset and quality applied.
    ///
    /// An explicit bitrate target is kept as is.
    pub fn apply(&self, settings: &EncodeSettings) -> EncodeSettings {
        let mut tuned = settings.clone();
        tuned.preset = self.preset();
        if let QualityTarget::Quality(base) = settings.target {
            tuned.target = QualityTarget::Quality(self.crf(base));
        }
        tuned
    }

    /// Whether content of `complexity` is worth a second pass.
    pub fn two_pass(&self, complexity: ContentComplexity) -> bool {
        match self {
            Self::Quality | Self::Size => true,
            Self::Speed => false,
            Self::Balanced => complexity >= ContentComplexity::High,
        }
    }

    /// Settings tuned to measured content.
    ///
    /// Two-pass profiles encode to the recommended bitrate, scaled for the
    /// target resolution. Single-pass profiles use the recommended quality,
    /// relaxed for low-complexity content. An explicit bitrate target is
    /// kept in both cases.
    pub fn tune(&self, settings: &EncodeSettings, analysis: &ContentAnalysis) -> EncodeSettings {
        let mut tuned = settings.clone();
        tuned.preset = self.preset();
        tuned.two_pass = self.two_pass(analysis.complexity);

        if let QualityTarget::Bitrate(_) = settings.target {
            return tuned;
        }
        if tuned.two_pass {
            let mut bitrate = analysis.recommended_bitrate as f64;
            if analysis.complexity == ContentComplexity::VeryHigh {
                bitrate *= 1.2;
            }
            if let Some(res) = settings.resolution {
                bitrate *= res.bitrate_multiplier();
            }
            tuned.target = QualityTarget::Bitrate(bitrate.round() as u64);
        } else {
            let mut crf = self.crf(analysis.recommended_crf);
            if analysis.complexity == ContentComplexity::Low {
                crf = (crf + 2).min(MAX_CRF);
            }
            tuned.target = QualityTarget::Quality(crf);
        }
        tuned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::TargetResolution;
    use rstest::rstest;

    #[rstest]
    #[case(CompressionProfile::Balanced, Preset::Medium, 23)]
    #[case(CompressionProfile::Quality, Preset::Slow, 21)]
    #[case(CompressionProfile::Size, Preset::Veryslow, 26)]
    #[case(CompressionProfile::Speed, Preset::Veryfast, 23)]
    fn test_profiles(
        #[case] profile: CompressionProfile,
        #[case] preset: Preset,
        #[case] crf: u32,
    ) {
        let tuned = profile.apply(&EncodeSettings::default());
        assert_eq!(tuned.preset, preset);
        assert_eq!(tuned.target, QualityTarget::Quality(crf));
    }

    #[test]
    fn test_crf_bounds() {
        assert_eq!(CompressionProfile::Quality.crf(18), 18);
        assert_eq!(CompressionProfile::Size.crf(27), 28);
        assert_eq!(CompressionProfile::Balanced.crf(40), 28);
    }

    fn analysis(complexity: ContentComplexity, bitrate: u64, crf: u32) -> ContentAnalysis {
        ContentAnalysis {
            complexity,
            motion_score: 40.0,
            scene_changes: 1,
            samples: 3,
            temporal_complexity: 50.0,
            spatial_complexity: 65.0,
            recommended_bitrate: bitrate,
            recommended_crf: crf,
        }
    }

    #[rstest]
    #[case(CompressionProfile::Quality, ContentComplexity::Low, true)]
    #[case(CompressionProfile::Size, ContentComplexity::Medium, true)]
    #[case(CompressionProfile::Speed, ContentComplexity::VeryHigh, false)]
    #[case(CompressionProfile::Balanced, ContentComplexity::Medium, false)]
    #[case(CompressionProfile::Balanced, ContentComplexity::High, true)]
    fn test_two_pass_choice(
        #[case] profile: CompressionProfile,
        #[case] complexity: ContentComplexity,
        #[case] expected: bool,
    ) {
        assert_eq!(profile.two_pass(complexity), expected);
    }

    #[test]
    fn test_tune_two_pass_uses_bitrate() {
        let settings = EncodeSettings {
            resolution: Some(TargetResolution::P720),
            ..Default::default()
        };
        let tuned = CompressionProfile::Balanced.tune(
            &settings,
            &analysis(ContentComplexity::VeryHigh, 10_000_000, 21),
        );
        assert!(tuned.two_pass);
        assert_eq!(tuned.preset, Preset::Medium);
        // 10M * 1.2 for very high complexity * 0.6 for 720p
        assert_eq!(tuned.target, QualityTarget::Bitrate(7_200_000));
    }

    #[test]
    fn test_tune_single_pass_uses_quality() {
        let settings = EncodeSettings::default();
        let speed = CompressionProfile::Speed
            .tune(&settings, &analysis(ContentComplexity::Medium, 8_000_000, 23));
        assert!(!speed.two_pass);
        assert_eq!(speed.target, QualityTarget::Quality(23));

        let low = CompressionProfile::Balanced
            .tune(&settings, &analysis(ContentComplexity::Low, 3_000_000, 25));
        assert!(!low.two_pass);
        assert_eq!(low.target, QualityTarget::Quality(27));

        let explicit = EncodeSettings {
            target: QualityTarget::Bitrate(2_000_000),
            ..Default::default()
        };
        let kept = CompressionProfile::Size
            .tune(&explicit, &analysis(ContentComplexity::High, 9_000_000, 22));
        assert!(kept.two_pass);
        assert_eq!(kept.target, QualityTarget::Bitrate(2_000_000));
    }

    #[test]
    fn test_bitrate_target_is_kept() {
        let settings = EncodeSettings {
            target: QualityTarget::Bitrate(2_500_000),
            ..Default::default()
        };
        let tuned = CompressionProfile::Size.apply(&settings);
        assert_eq!(tuned.target, QualityTarget::Bitrate(2_500_000));
        assert_eq!("SPEED".parse::<CompressionProfile>().unwrap(), CompressionProfile::Speed);
    }
}
