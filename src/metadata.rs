// PNG text metadata, the way ComfyUI writes it:
// a "prompt" text chunk and a compressed iTXt "workflow" chunk holding the editor document.
// Images come back from the backend already encoded; we decode them and write a fresh PNG
// so the chunks land ahead of the image data where readers look for them.

use std::io::Cursor;

use anyhow::{Context, Result};
use png::text_metadata::{ITXtChunk, TEXtChunk};
use serde::Serialize;

pub const PROMPT_KEY: &str = "prompt";
pub const WORKFLOW_KEY: &str = "workflow";

/// Re-encodes `image` as an RGBA PNG carrying the prompt and workflow.
pub fn embed(image: &[u8], prompt: &str, workflow_json: &str) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(image).context("failed to decode image")?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().context("failed to write PNG header")?;

        // tEXt is Latin-1 only; anything else goes into an uncompressed iTXt under the same key.
        if prompt.chars().all(|c| (c as u32) < 256) {
            writer
                .write_text_chunk(&TEXtChunk::new(PROMPT_KEY, prompt))
                .context("failed to write prompt chunk")?;
        } else {
            writer
                .write_text_chunk(&ITXtChunk::new(PROMPT_KEY, prompt))
                .context("failed to write prompt chunk")?;
        }

        let mut workflow = ITXtChunk::new(WORKFLOW_KEY, workflow_json);
        workflow.compressed = true;
        workflow.language_tag = "en".to_string();
        workflow.translated_keyword = WORKFLOW_KEY.to_string();
        writer
            .write_text_chunk(&workflow)
            .context("failed to write workflow chunk")?;

        writer
            .write_image_data(rgba.as_raw())
            .context("failed to write image data")?;
        writer.finish().context("failed to finish PNG")?;
    }
    Ok(out)
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct EmbeddedMetadata {
    pub prompt: Option<String>,
    pub workflow: Option<String>,
}

/// Reads back what `embed` wrote, from either chunk type.
pub fn read(png_bytes: &[u8]) -> Result<EmbeddedMetadata> {
    let decoder = png::Decoder::new(Cursor::new(png_bytes));
    let reader = decoder.read_info().context("failed to read PNG")?;
    let info = reader.info();
    let mut found = EmbeddedMetadata::default();
    for chunk in &info.uncompressed_latin1_text {
        assign(&mut found, &chunk.keyword, chunk.text.clone());
    }
    for chunk in &info.compressed_latin1_text {
        let text = chunk.get_text().context("bad zTXt chunk")?;
        assign(&mut found, &chunk.keyword, text);
    }
    for chunk in &info.utf8_text {
        let text = chunk.get_text().context("bad iTXt chunk")?;
        assign(&mut found, &chunk.keyword, text);
    }
    Ok(found)
}

fn assign(found: &mut EmbeddedMetadata, keyword: &str, text: String) {
    match keyword {
        PROMPT_KEY => found.prompt = Some(text),
        WORKFLOW_KEY => found.workflow = Some(text),
        _ => {}
    }
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 90]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
        .unwrap();
    bytes
}
