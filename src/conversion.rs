//! Pixel layout conversion.
//!
//! [`yuv420_to_rgb`] turns a tightly packed planar 4:2:0 picture into an
//! interleaved RGB buffer ready for image compression. [`pack_planes`] copies
//! strided decoder planes into that tight layout.

use crate::error::FrameServeError;

/// Number of bytes a `width`×`height` planar 4:2:0 picture occupies:
/// one full luma plane and two chroma planes of `(width/2)×(height/2)`.
pub fn planar_len(width: u32, height: u32) -> usize {
    let luma = width as usize * height as usize;
    let chroma = (width as usize / 2) * (height as usize / 2);
    luma + 2 * chroma
}

/// Convert a planar 4:2:0 buffer to interleaved 8-bit RGB.
///
/// The input is laid out as `[Y: width*height][U: (width/2)*(height/2)][V: same]`.
/// Odd dimensions are handled by floor division of the chroma index, so the
/// last column/row reuses the preceding chroma sample. Output pixels are in
/// row-major order, three bytes per pixel.
///
/// # Errors
///
/// Returns [`FrameServeError::InvalidPicture`] if `planar` is shorter than
/// [`planar_len`] for the given dimensions.
pub fn yuv420_to_rgb(planar: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameServeError> {
    let expected = planar_len(width, height);
    if planar.len() < expected {
        return Err(FrameServeError::InvalidPicture(format!(
            "{width}x{height} picture needs {expected} bytes, got {}",
            planar.len()
        )));
    }

    let width = width as usize;
    let height = height as usize;
    let half_width = width / 2;
    let u_start = width * height;
    let v_start = u_start + half_width * (height / 2);

    let luma = &planar[..u_start];
    let chroma_u = &planar[u_start..v_start];
    let chroma_v = &planar[v_start..expected];

    let last_column = half_width.saturating_sub(1);
    let last_row = (height / 2).saturating_sub(1);

    let mut rgb = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let chroma_row = (y / 2).min(last_row) * half_width;
        for x in 0..width {
            let luma_value = luma[y * width + x] as f64;
            let chroma_index = chroma_row + (x / 2).min(last_column);
            // Zero-width chroma planes (width or height of 1) fall back to grey.
            let u = chroma_u.get(chroma_index).map_or(0.0, |&u| u as f64 - 128.0);
            let v = chroma_v.get(chroma_index).map_or(0.0, |&v| v as f64 - 128.0);

            rgb.push(clamp_channel(luma_value + 1.402 * v));
            rgb.push(clamp_channel(luma_value - 0.344 * u - 0.714 * v));
            rgb.push(clamp_channel(luma_value + 1.772 * u));
        }
    }

    Ok(rgb)
}

fn clamp_channel(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Copy one strided plane into `out`, dropping row padding.
///
/// `row_bytes` is the visible width of the plane in bytes and `rows` the
/// number of visible rows.
pub fn pack_plane(
    data: &[u8],
    stride: usize,
    row_bytes: usize,
    rows: usize,
    out: &mut Vec<u8>,
) -> Result<(), FrameServeError> {
    if stride == row_bytes {
        let length = row_bytes * rows;
        let plane = data.get(..length).ok_or_else(|| short_plane(length, data.len()))?;
        out.extend_from_slice(plane);
        return Ok(());
    }

    for row in 0..rows {
        let row_start = row * stride;
        let line = data
            .get(row_start..row_start + row_bytes)
            .ok_or_else(|| short_plane(row_start + row_bytes, data.len()))?;
        out.extend_from_slice(line);
    }
    Ok(())
}

/// Pack three strided 4:2:0 planes into one tight planar buffer.
pub fn pack_planes(
    planes: [(&[u8], usize); 3],
    width: u32,
    height: u32,
) -> Result<Vec<u8>, FrameServeError> {
    let width = width as usize;
    let height = height as usize;
    let mut out = Vec::with_capacity(planar_len(width as u32, height as u32));

    let [(luma, luma_stride), (u, u_stride), (v, v_stride)] = planes;
    pack_plane(luma, luma_stride, width, height, &mut out)?;
    pack_plane(u, u_stride, width / 2, height / 2, &mut out)?;
    pack_plane(v, v_stride, width / 2, height / 2, &mut out)?;
    Ok(out)
}

fn short_plane(needed: usize, available: usize) -> FrameServeError {
    FrameServeError::InvalidPicture(format!(
        "plane holds {available} bytes but {needed} are required"
    ))
}
