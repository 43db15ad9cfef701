//! QR rendering for pairing payloads

use base64::{Engine, engine::general_purpose::STANDARD};
use qrcode::QrCode;
use qrcode::render::{svg, unicode};

use crate::error::{ApiError, Result};

fn encode(payload: &str) -> Result<QrCode> {
    QrCode::new(payload.as_bytes())
        .map_err(|e| ApiError::Internal(format!("QR encoding failed: {}", e)))
}

/// `data:image/svg+xml;base64,...` URL of the payload's QR code
pub fn svg_data_url(payload: &str) -> Result<String> {
    let image = encode(payload)?
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}

/// QR code drawn with Unicode half blocks, for terminal output
pub fn render_unicode(payload: &str) -> Result<String> {
    Ok(encode(payload)?
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}
