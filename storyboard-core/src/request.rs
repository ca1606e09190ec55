use std::ops::RangeInclusive;

use serde_json::{Map, Value};

use crate::{prompt::DEFAULT_NEGATIVE_PROMPT, JobError, JobResult};

pub const DEFAULT_WIDTH: usize = 1024;
/// 1024x768 is a 4:3 landscape frame.
pub const DEFAULT_HEIGHT: usize = 768;
pub const DEFAULT_STEPS: usize = 28;
pub const DEFAULT_GUIDANCE: f64 = 6.5;
pub const DEFAULT_ADAPTER_SCALE: f64 = 0.75;

const DIMENSION_RANGE: RangeInclusive<u64> = 64..=2048;
const STEPS_RANGE: RangeInclusive<u64> = 1..=150;
const MAX_GUIDANCE: f64 = 30.0;

/// Input keys recognised in a job's `input` object.
pub mod keys {
    pub const PANEL_PROMPT: &str = "panel_prompt";
    pub const PROMPT: &str = "prompt";
    pub const CHARACTER_PROMPT: &str = "character_prompt";
    pub const STYLE_PROMPT: &str = "style_prompt";
    pub const NEGATIVE_PROMPT: &str = "negative_prompt";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const STEPS: &str = "num_inference_steps";
    pub const GUIDANCE: &str = "guidance_scale";
    pub const SEED: &str = "seed";
    pub const REFERENCE_IMAGE: &str = "reference_image";
    pub const ADAPTER_SCALE: &str = "ip_adapter_scale";
}

/// A fully defaulted and validated job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobParams {
    /// Scene description for the panel, trimmed and non-empty.
    pub description: String,
    pub character: Option<String>,
    pub style: Option<String>,
    /// `None` means "not provided"; an explicit empty string disables the negative prompt.
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    /// Negative seeds are allowed; see [`crate::invoker::sampling_request`].
    pub seed: Option<i64>,
    /// Still transport-encoded; decoded by the invoker.
    pub reference_image: Option<String>,
    pub adapter_scale: f64,
}

impl JobParams {
    pub fn negative_prompt(&self) -> &str {
        self.negative_prompt
            .as_deref()
            .unwrap_or(DEFAULT_NEGATIVE_PROMPT)
    }

    /// Decodes the raw `input` mapping of a job.
    pub fn from_input(input: &Map<String, Value>) -> JobResult<Self> {
        let description = match non_blank(input, keys::PANEL_PROMPT)? {
            Some(description) => Some(description),
            None => non_blank(input, keys::PROMPT)?,
        }
        .ok_or_else(|| {
            JobError::validation(format!(
                "Missing '{}' or '{}' in input.",
                keys::PANEL_PROMPT,
                keys::PROMPT
            ))
        })?;

        let width = dimension(input, keys::WIDTH, DEFAULT_WIDTH)?;
        let height = dimension(input, keys::HEIGHT, DEFAULT_HEIGHT)?;

        let steps = integer(input, keys::STEPS)?.unwrap_or(DEFAULT_STEPS as u64);
        if !STEPS_RANGE.contains(&steps) {
            return Err(out_of_range(keys::STEPS, &STEPS_RANGE));
        }

        let guidance = float(input, keys::GUIDANCE)?.unwrap_or(DEFAULT_GUIDANCE);
        if !(guidance > 0.0 && guidance <= MAX_GUIDANCE) {
            return Err(JobError::validation(format!(
                "'{}' must be greater than 0 and at most {MAX_GUIDANCE}",
                keys::GUIDANCE
            )));
        }

        let adapter_scale = float(input, keys::ADAPTER_SCALE)?.unwrap_or(DEFAULT_ADAPTER_SCALE);
        if !(0.0..=1.0).contains(&adapter_scale) {
            return Err(JobError::validation(format!(
                "'{}' must be between 0 and 1",
                keys::ADAPTER_SCALE
            )));
        }

        let reference_image = optional_string(input, keys::REFERENCE_IMAGE)?
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            description,
            character: optional_string(input, keys::CHARACTER_PROMPT)?,
            style: optional_string(input, keys::STYLE_PROMPT)?,
            negative_prompt: optional_string(input, keys::NEGATIVE_PROMPT)?,
            width,
            height,
            steps: steps as usize,
            guidance,
            seed: seed(input)?,
            reference_image,
            adapter_scale,
        })
    }
}

fn optional_string(input: &Map<String, Value>, key: &str) -> JobResult<Option<String>> {
    match input.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(JobError::validation(format!("'{key}' must be a string"))),
    }
}

/// Trimmed string value, `None` when absent or blank.
fn non_blank(input: &Map<String, Value>, key: &str) -> JobResult<Option<String>> {
    Ok(optional_string(input, key)?
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

/// Reads a non-negative integer. Integral floats and numeric strings are accepted.
fn integer(input: &Map<String, Value>, key: &str) -> JobResult<Option<u64>> {
    let invalid = || JobError::validation(format!("'{key}' must be a non-negative integer"));
    let value = match input.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => v,
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
                .ok_or_else(invalid)?,
        },
        Some(Value::String(s)) => serde_plain::from_str::<u64>(s.trim()).map_err(|_| invalid())?,
        Some(_) => return Err(invalid()),
    };
    Ok(Some(value))
}

/// Reads a signed 64-bit seed. Integral floats and numeric strings are accepted.
fn seed(input: &Map<String, Value>) -> JobResult<Option<i64>> {
    let invalid = || JobError::validation(format!("'{}' must be a 64-bit integer", keys::SEED));
    let value = match input.get(keys::SEED) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) => v,
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
                .map(|f| f as i64)
                .ok_or_else(invalid)?,
        },
        Some(Value::String(s)) => serde_plain::from_str::<i64>(s.trim()).map_err(|_| invalid())?,
        Some(_) => return Err(invalid()),
    };
    Ok(Some(value))
}

/// Reads a finite float. Numeric strings are accepted.
fn float(input: &Map<String, Value>, key: &str) -> JobResult<Option<f64>> {
    let invalid = || JobError::validation(format!("'{key}' must be a number"));
    let value = match input.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(invalid)?,
        Some(Value::String(s)) => serde_plain::from_str::<f64>(s.trim()).map_err(|_| invalid())?,
        Some(_) => return Err(invalid()),
    };
    if !value.is_finite() {
        return Err(invalid());
    }
    Ok(Some(value))
}

fn dimension(input: &Map<String, Value>, key: &str, default: usize) -> JobResult<usize> {
    let value = integer(input, key)?.unwrap_or(default as u64);
    if !DIMENSION_RANGE.contains(&value) {
        return Err(out_of_range(key, &DIMENSION_RANGE));
    }
    if value % 8 != 0 {
        return Err(JobError::validation(format!("'{key}' must be a multiple of 8")));
    }
    Ok(value as usize)
}

fn out_of_range(key: &str, range: &RangeInclusive<u64>) -> JobError {
    JobError::validation(format!(
        "'{key}' must be between {} and {}",
        range.start(),
        range.end()
    ))
}
