//! Prompt assembly for storyboard panels.

/// House style applied to every panel unless the job overrides it.
pub const DEFAULT_STYLE_PROMPT: &str = "clean flat illustrative storyboard, modern product design style, soft colors, \
subtle lighting, minimal background clutter, business environment, \
average, relatable people, natural body types, realistic proportions, \
subtle facial expressions, no speech bubbles, no on-image text, no UI screenshots";

/// Negative prompt used when the job does not provide one.
pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, distorted, disfigured, extra limbs, extra fingers, missing limbs, \
text, caption, subtitles, watermark, logo, words, extreme closeup, fisheye, \
overly muscular, caricature, exaggerated expression, horror, gore, low quality";

const FRAGMENT_SEPARATOR: &str = ". ";

/// Joins scene, character and style into one prompt.
///
/// Every fragment is trimmed and empty fragments are dropped, so the separator never doubles up.
/// A missing or blank style falls back to [`DEFAULT_STYLE_PROMPT`].
pub fn compose(scene: &str, character: Option<&str>, style: Option<&str>) -> String {
    let style = style
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_STYLE_PROMPT);

    [Some(scene), character, Some(style)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .collect::<Vec<_>>()
        .join(FRAGMENT_SEPARATOR)
}
