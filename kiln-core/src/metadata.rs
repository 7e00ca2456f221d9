//! Artifact encoding with embedded provenance
//!
//! PNG output carries the provenance record as tEXt chunks, one per field.
//! JPEG output carries the JSON-serialized record in a COM segment spliced
//! in directly after SOI. Metadata failures never fail the artifact; callers
//! fall back to the unstamped bytes.

use anyhow::Context;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageEncoder, RgbImage};
use tracing::warn;

use crate::provenance::ProvenanceRecord;

/// Encode to PNG, embedding the record's text fields when present.
pub fn encode_png(image: &RgbImage, record: Option<&ProvenanceRecord>) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = png::Encoder::new(&mut buf, image.width(), image.height());
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    if let Some(record) = record {
        for (keyword, value) in record.text_fields() {
            // Invalid keyword or text drops that one field, not the image.
            if let Err(e) = encoder.add_text_chunk(keyword.clone(), value) {
                warn!(keyword = %keyword, error = %e, "skipping metadata text chunk");
            }
        }
    }
    let mut writer = encoder.write_header().context("png header")?;
    writer
        .write_image_data(image.as_raw())
        .context("png image data")?;
    writer.finish().context("png finish")?;
    Ok(buf)
}

/// Encode to JPEG at the given quality, embedding the record as a JSON
/// comment segment when present.
pub fn encode_jpeg(
    image: &RgbImage,
    record: Option<&ProvenanceRecord>,
    quality: u8,
) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
        )
        .context("jpeg encode")?;

    if let Some(record) = record {
        match build_comment_segment(record) {
            Ok(segment) => buf = splice_after_soi(buf, &segment),
            Err(e) => warn!(error = %e, "skipping jpeg provenance comment"),
        }
    }
    Ok(buf)
}

/// COM segment: marker, big-endian length covering the length field itself,
/// then the payload.
fn build_comment_segment(record: &ProvenanceRecord) -> anyhow::Result<Vec<u8>> {
    let comment = serde_json::to_vec(record).context("serialize provenance")?;
    let length = comment.len() + 2;
    if length > u16::MAX as usize {
        anyhow::bail!("provenance comment exceeds segment capacity");
    }
    let mut segment = Vec::with_capacity(comment.len() + 4);
    segment.extend_from_slice(&[0xFF, 0xFE]);
    segment.extend_from_slice(&(length as u16).to_be_bytes());
    segment.extend_from_slice(&comment);
    Ok(segment)
}

fn splice_after_soi(jpeg: Vec<u8>, segment: &[u8]) -> Vec<u8> {
    // SOI is always the first two bytes of a well-formed JPEG.
    let mut out = Vec::with_capacity(jpeg.len() + segment.len());
    out.extend_from_slice(&jpeg[..2]);
    out.extend_from_slice(segment);
    out.extend_from_slice(&jpeg[2..]);
    out
}
