//! Persistence of generated images: deterministic file naming and PNG
//! text-chunk metadata. The output directory is the entire storage layer.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;

/// Generation parameters embedded into every saved image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub prompt: String,
    pub num_steps: usize,
    pub guidance: f64,
    pub origin_steps: usize,
}

impl ImageMetadata {
    fn pairs(&self) -> Vec<(String, String)> {
        vec![
            ("prompt".to_string(), self.prompt.clone()),
            ("num_steps".to_string(), self.num_steps.to_string()),
            ("guidance".to_string(), self.guidance.to_string()),
            ("origin_steps".to_string(), self.origin_steps.to_string()),
        ]
    }
}

/// Local-time slug used as the filename prefix for a batch.
pub fn timestamp_slug() -> String {
    chrono::Local::now().format("%m-%d-%H-%M-%S").to_string()
}

/// Derive the output filename from the prompt, a timestamp slug and the
/// index of the image within its batch. The snippet keeps the first three
/// whitespace-separated prompt tokens, stripped of characters that are not
/// filesystem-safe.
pub fn filename_for(prompt: &str, timestamp: &str, index: usize) -> String {
    let snippet = prompt
        .split_whitespace()
        .take(3)
        .map(sanitize_token)
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    let snippet = if snippet.is_empty() { "image".to_string() } else { snippet };
    format!("{timestamp}_{snippet}_{index}.png")
}

fn sanitize_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

/// Save an image as PNG with the metadata embedded as tEXt chunks.
pub fn save_png(image: &DynamicImage, path: &Path, metadata: &ImageMetadata) -> Result<()> {
    let rgb = image.to_rgb8();
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), rgb.width(), rgb.height());
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    for (key, value) in metadata.pairs() {
        encoder
            .add_text_chunk(key, value)
            .context("failed to add metadata chunk")?;
    }
    let mut writer = encoder
        .write_header()
        .with_context(|| format!("failed to write PNG header for {}", path.display()))?;
    writer
        .write_image_data(rgb.as_raw())
        .with_context(|| format!("failed to write image data for {}", path.display()))?;
    Ok(())
}

/// Read back the tEXt metadata pairs embedded in a saved image.
pub fn read_metadata(path: &Path) -> Result<Vec<(String, String)>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let decoder = png::Decoder::new(file);
    let reader = decoder
        .read_info()
        .with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(reader
        .info()
        .uncompressed_latin1_text
        .iter()
        .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ImageMetadata {
        ImageMetadata {
            prompt: "a scenic watercolor landscape".to_string(),
            num_steps: 8,
            guidance: 30.0,
            origin_steps: 8,
        }
    }

    #[test]
    fn filename_is_deterministic() {
        let a = filename_for("a scenic watercolor landscape", "01-02-03-04-05", 0);
        let b = filename_for("a scenic watercolor landscape", "01-02-03-04-05", 0);
        assert_eq!(a, b);
        assert_eq!(a, "01-02-03-04-05_a_scenic_watercolor_0.png");
    }

    #[test]
    fn snippet_takes_at_most_three_tokens() {
        let name = filename_for("one two three four five", "ts", 2);
        assert_eq!(name, "ts_one_two_three_2.png");
        let name = filename_for("single", "ts", 0);
        assert_eq!(name, "ts_single_0.png");
    }

    #[test]
    fn empty_and_unsafe_prompts_fall_back() {
        assert_eq!(filename_for("", "ts", 0), "ts_image_0.png");
        assert_eq!(filename_for("   ", "ts", 1), "ts_image_1.png");
        assert_eq!(filename_for("/// ???", "ts", 0), "ts_image_0.png");
    }

    #[test]
    fn path_separators_are_stripped() {
        let name = filename_for("../escape attempt", "ts", 0);
        assert!(!name.contains('/'), "{name}");
        assert_eq!(name, "ts_..escape_attempt_0.png");
    }

    #[test]
    fn metadata_round_trips_through_text_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            4,
            4,
            image::Rgb([10, 20, 30]),
        ));
        save_png(&image, &path, &metadata()).unwrap();

        let pairs = read_metadata(&path).unwrap();
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("prompt"), Some("a scenic watercolor landscape"));
        assert_eq!(get("num_steps"), Some("8"));
        assert_eq!(get("guidance"), Some("30"));
        assert_eq!(get("origin_steps"), Some("8"));
    }

    #[test]
    fn saved_file_is_a_decodable_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let image = DynamicImage::ImageRgb8(image::RgbImage::new(8, 6));
        save_png(&image, &path, &metadata()).unwrap();

        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 6));
    }
}
