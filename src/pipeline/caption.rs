//! Captioning model boundary.
//!
//! The model runs out of process; [`HttpCaptioner`] ships a batch of images
//! to an inference endpoint and gets one caption per image back.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::RgbImage;
use reqwest::{blocking::Client, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};

use crate::{config::CaptioningConfig, images};

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("inference endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("expected {expected} captions, got {got}")]
    Misaligned { expected: usize, got: usize },

    #[error("failed to encode image: {0}")]
    Image(#[from] anyhow::Error),
}

/// Produces one caption per image, in input order.
pub trait Captioner: Send + Sync {
    fn caption(&self, images: &[RgbImage]) -> Result<Vec<String>, InferenceError>;
}

#[derive(Serialize)]
struct CaptionRequest {
    images: Vec<String>,
    max_length: u32,
    num_beams: u32,
}

#[derive(Deserialize)]
struct CaptionResponse {
    captions: Vec<String>,
}

pub struct HttpCaptioner {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    max_length: u32,
    num_beams: u32,
    max_dimension: u32,
}

impl HttpCaptioner {
    pub fn new(config: &CaptioningConfig) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config
                .api_key
                .as_ref()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            max_length: config.max_length,
            num_beams: config.num_beams,
            max_dimension: config.max_dimension,
        })
    }

    fn encode(&self, img: &RgbImage) -> Result<String, InferenceError> {
        let scaled = images::downscale(img.clone(), self.max_dimension);
        let png = images::encode_png(&scaled)?;
        Ok(STANDARD.encode(png))
    }
}

impl Captioner for HttpCaptioner {
    fn caption(&self, batch: &[RgbImage]) -> Result<Vec<String>, InferenceError> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let encoded = batch
            .iter()
            .map(|img| self.encode(img))
            .collect::<Result<Vec<_>, _>>()?;

        let request = CaptionRequest {
            images: encoded,
            max_length: self.max_length,
            num_beams: self.num_beams,
        };

        let mut req = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            req = req.header(AUTHORIZATION, format!("Bearer {key}"));
        }

        let resp = req.send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let response: CaptionResponse = resp.json()?;
        check_alignment(batch.len(), response.captions)
    }
}

/// Verifies the model returned exactly one caption per image and trims them.
pub fn check_alignment(expected: usize, captions: Vec<String>) -> Result<Vec<String>, InferenceError> {
    if captions.len() != expected {
        return Err(InferenceError::Misaligned {
            expected,
            got: captions.len(),
        });
    }

    Ok(captions.into_iter().map(|c| c.trim().to_string()).collect())
}
