//! Property-based tests using proptest
//!
//! These tests check the numeric codec and key parsing across randomized
//! inputs, catching edge cases example-based tests tend to miss.

use model_keeper::models::download::RetryPolicy;
use model_keeper::models::quantize::codec::{self, BlockQuantizer, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
use model_keeper::models::quantize::PrecisionLevel;
use model_keeper::models::{ModelKey, ModelRole};
use proptest::prelude::*;
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Strategies
// =============================================================================

fn arb_role() -> impl Strategy<Value = ModelRole> {
    prop_oneof![Just(ModelRole::Language), Just(ModelRole::Embeddings)]
}

fn arb_precision() -> impl Strategy<Value = PrecisionLevel> {
    prop::sample::select(PrecisionLevel::ALL.to_vec())
}

/// Weight-like values: mostly small, occasionally large
fn arb_weights() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(
        prop_oneof![
            8 => -1.0f32..1.0,
            1 => -500.0f32..500.0,
            1 => Just(0.0f32),
        ],
        1..600,
    )
}

fn write_fp32(dir: &TempDir, values: &[f32]) -> std::path::PathBuf {
    let path = dir.path().join("source.bin");
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(&path, bytes).expect("Failed to write source");
    path
}

// =============================================================================
// Key Parsing
// =============================================================================

proptest! {
    /// Display output parses back to the same key, hyphens in names included
    #[test]
    fn model_key_display_parses_back(role in arb_role(), name in "[a-z0-9][a-z0-9._-]{0,40}") {
        let key = ModelKey::new(role, name.clone());
        let parsed: ModelKey = key.to_string().parse().expect("Failed to parse key");
        prop_assert_eq!(parsed.role(), role);
        prop_assert_eq!(parsed.name(), name.as_str());
    }

    /// Keys survive JSON as plain strings
    #[test]
    fn model_key_serde_as_string(role in arb_role(), name in "[a-z][a-z0-9-]{0,20}") {
        let key = ModelKey::new(role, name);
        let json = serde_json::to_string(&key).expect("Failed to serialize key");
        prop_assert_eq!(&json, &format!("\"{}\"", key));
        let parsed: ModelKey = serde_json::from_str(&json).expect("Failed to parse key");
        prop_assert_eq!(parsed, key);
    }

    /// Unknown roles are rejected
    #[test]
    fn unknown_role_rejected(role in "[a-z]{3,10}", name in "[a-z]{1,10}") {
        prop_assume!(role != "language" && role != "embeddings");
        let text = format!("{}-{}", role, name);
        prop_assert!(text.parse::<ModelKey>().is_err());
    }

    /// Precision names parse regardless of case
    #[test]
    fn precision_parse_ignores_case(level in arb_precision(), upper in any::<bool>()) {
        let text = if upper { level.to_string().to_uppercase() } else { level.to_string() };
        prop_assert_eq!(text.parse::<PrecisionLevel>().expect("Failed to parse"), level);
    }
}

// =============================================================================
// FP16 Conversion
// =============================================================================

proptest! {
    /// Normal-range values come back within half-precision rounding error
    #[test]
    fn f16_relative_error_bounded(value in prop_oneof![-65000.0f32..-1e-4, 1e-4f32..65000.0]) {
        let back = codec::f16_bits_to_f32(codec::f32_to_f16_bits(value));
        let rel = ((back - value) / value).abs();
        prop_assert!(rel <= 1.0 / 2048.0, "{} -> {} (rel {})", value, back, rel);
    }

    /// Conversion preserves sign and never produces NaN from finite input
    #[test]
    fn f16_preserves_sign(value in -1.0e6f32..1.0e6) {
        let back = codec::f16_bits_to_f32(codec::f32_to_f16_bits(value));
        prop_assert!(!back.is_nan());
        if value != 0.0 && back != 0.0 {
            prop_assert_eq!(back.is_sign_negative(), value.is_sign_negative());
        }
    }
}

// =============================================================================
// Block Quantization
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// INT8 error is at most one quantization step of the largest block scale
    #[test]
    fn int8_error_bounded(values in arb_weights()) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let input = write_fp32(&dir, &values);
        let output = dir.path().join("out.int8.bin");

        BlockQuantizer::default()
            .convert_file(&input, &output, PrecisionLevel::Fp32, PrecisionLevel::Int8)
            .expect("Conversion failed");

        let bytes = std::fs::read(&output).expect("Failed to read output");
        prop_assert_eq!(
            bytes.len() as u64,
            codec::encoded_len(values.len() as u64 * 4, PrecisionLevel::Int8, DEFAULT_BLOCK_SIZE)
        );

        let decoded = codec::decode(&bytes).expect("Failed to decode");
        prop_assert_eq!(decoded.len(), values.len());

        let absmax = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let step = absmax / 127.0;
        for (orig, back) in values.iter().zip(&decoded) {
            prop_assert!((orig - back).abs() <= step + 1e-6, "{} -> {}", orig, back);
        }
    }

    /// INT4 output matches the predicted size and keeps the element count
    #[test]
    fn int4_size_matches_prediction(values in arb_weights()) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let input = write_fp32(&dir, &values);
        let int8 = dir.path().join("out.int8.bin");
        let int4 = dir.path().join("out.int4.bin");

        let quantizer = BlockQuantizer::default();
        quantizer
            .convert_file(&input, &int8, PrecisionLevel::Fp32, PrecisionLevel::Int8)
            .expect("INT8 conversion failed");
        quantizer
            .convert_file(&int8, &int4, PrecisionLevel::Int8, PrecisionLevel::Int4)
            .expect("INT4 conversion failed");

        let bytes = std::fs::read(&int4).expect("Failed to read output");
        prop_assert_eq!(
            bytes.len() as u64,
            codec::encoded_len(values.len() as u64 * 4, PrecisionLevel::Int4, DEFAULT_BLOCK_SIZE)
        );
        prop_assert_eq!(codec::decode(&bytes).expect("Failed to decode").len(), values.len());
    }
}

// =============================================================================
// Size Invariants
// =============================================================================

proptest! {
    /// Every reduction step shrinks the file once past a handful of weights
    #[test]
    fn variant_sizes_monotonic(elements in 16u64..1_000_000, block in MIN_BLOCK_SIZE..512) {
        let source = elements * 4;
        let fp16 = codec::encoded_len(source, PrecisionLevel::Fp16, block);
        let int8 = codec::encoded_len(source, PrecisionLevel::Int8, block);
        let int4 = codec::encoded_len(source, PrecisionLevel::Int4, block);

        prop_assert!(fp16 < source);
        prop_assert!(int8 < fp16, "int8 {} fp16 {}", int8, fp16);
        prop_assert!(int4 <= int8);
    }

    /// Retry delays never shrink and there is one fewer than attempts
    #[test]
    fn retry_schedule_grows(attempts in 1u32..8, initial_ms in 1u64..5000, multiplier in 1.0f64..4.0) {
        let policy = RetryPolicy {
            max_attempts: attempts,
            initial_backoff: Duration::from_millis(initial_ms),
            backoff_multiplier: multiplier,
        };
        let schedule = policy.schedule();
        prop_assert_eq!(schedule.len() as u32, attempts - 1);
        for pair in schedule.windows(2) {
            prop_assert!(pair[1] >= pair[0]);
        }
    }
}
