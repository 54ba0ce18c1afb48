//! Blocking JSON client for the vision gateway.
//!
//! Every operation is `POST {endpoint}/<operation>` with a JSON body.
//! HTTP 404 maps to `VisionError::NotFound`, 409 to `AlreadyExists`.

use atrium_core::vision::{FaceMatch, FacePage, FaceRecord, LabelPage, TextDetection};
use atrium_core::{ObjectRef, VisionError, VisionService};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct HttpVisionClient {
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Serialize)]
struct CollectionRequest<'a> {
    collection: &'a str,
}

#[derive(Serialize)]
struct IndexFaceRequest<'a> {
    collection: &'a str,
    image: &'a ObjectRef,
    external_id: &'a str,
    max_faces: u32,
}

#[derive(Debug, Deserialize)]
struct IndexFaceResponse {
    #[serde(default)]
    faces: Vec<FaceRecord>,
}

#[derive(Serialize)]
struct SearchFacesRequest<'a> {
    collection: &'a str,
    image: &'a ObjectRef,
    max_faces: u32,
    threshold: f32,
}

#[derive(Debug, Deserialize)]
struct SearchFacesResponse {
    #[serde(default)]
    matches: Vec<FaceMatch>,
}

#[derive(Serialize)]
struct DeleteFacesRequest<'a> {
    collection: &'a str,
    face_ids: &'a [String],
}

#[derive(Serialize)]
struct ListFacesRequest<'a> {
    collection: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Serialize)]
struct DetectTextRequest<'a> {
    image: &'a ObjectRef,
}

#[derive(Debug, Deserialize)]
struct DetectTextResponse {
    #[serde(default)]
    detections: Vec<TextDetection>,
}

#[derive(Serialize)]
struct StartLabelRequest<'a> {
    video: &'a ObjectRef,
    min_confidence: f32,
}

#[derive(Debug, Deserialize)]
struct StartLabelResponse {
    job_id: String,
}

#[derive(Serialize)]
struct GetLabelRequest<'a> {
    job_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Empty {}

/// Map a non-success gateway response onto the vision error taxonomy.
fn classify(status: StatusCode, body: &str) -> VisionError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        body.trim().to_string()
    };
    match status {
        StatusCode::NOT_FOUND => VisionError::NotFound(detail),
        StatusCode::CONFLICT => VisionError::AlreadyExists(detail),
        _ => VisionError::Request(format!("{status}: {detail}")),
    }
}

fn decode<T: DeserializeOwned>(operation: &str, body: &str) -> Result<T, VisionError> {
    // Empty bodies are accepted for operations without a payload.
    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body)
        .map_err(|e| VisionError::InvalidResponse(format!("{operation}: {e}")))
}

impl HttpVisionClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, VisionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VisionError::Request(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn url(&self, operation: &str) -> String {
        format!("{}/{operation}", self.endpoint)
    }

    fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<R, VisionError> {
        let mut request = self.client.post(self.url(operation)).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .map_err(|e| VisionError::Request(format!("{operation}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| VisionError::Request(format!("{operation}: {e}")))?;

        if !status.is_success() {
            tracing::debug!(operation, status = %status, "vision gateway error");
            return Err(classify(status, &text));
        }
        decode(operation, &text)
    }
}

impl VisionService for HttpVisionClient {
    fn describe_collection(&self, collection: &str) -> Result<(), VisionError> {
        let _: Empty = self.call("describe_collection", &CollectionRequest { collection })?;
        Ok(())
    }

    fn create_collection(&self, collection: &str) -> Result<(), VisionError> {
        let _: Empty = self.call("create_collection", &CollectionRequest { collection })?;
        Ok(())
    }

    fn index_face(
        &self,
        collection: &str,
        image: &ObjectRef,
        external_id: &str,
        max_faces: u32,
    ) -> Result<Vec<FaceRecord>, VisionError> {
        let resp: IndexFaceResponse = self.call(
            "index_faces",
            &IndexFaceRequest {
                collection,
                image,
                external_id,
                max_faces,
            },
        )?;
        Ok(resp.faces)
    }

    fn search_faces(
        &self,
        collection: &str,
        image: &ObjectRef,
        max_candidates: u32,
        min_similarity: f32,
    ) -> Result<Vec<FaceMatch>, VisionError> {
        let resp: SearchFacesResponse = self.call(
            "search_faces_by_image",
            &SearchFacesRequest {
                collection,
                image,
                max_faces: max_candidates,
                threshold: min_similarity,
            },
        )?;
        Ok(resp.matches)
    }

    fn delete_faces(&self, collection: &str, descriptor_ids: &[String]) -> Result<(), VisionError> {
        let _: Empty = self.call(
            "delete_faces",
            &DeleteFacesRequest {
                collection,
                face_ids: descriptor_ids,
            },
        )?;
        Ok(())
    }

    fn list_faces(
        &self,
        collection: &str,
        next_token: Option<&str>,
    ) -> Result<FacePage, VisionError> {
        self.call(
            "list_faces",
            &ListFacesRequest {
                collection,
                next_token,
            },
        )
    }

    fn detect_text(&self, image: &ObjectRef) -> Result<Vec<TextDetection>, VisionError> {
        let resp: DetectTextResponse = self.call("detect_text", &DetectTextRequest { image })?;
        Ok(resp.detections)
    }

    fn start_label_detection(
        &self,
        video: &ObjectRef,
        min_confidence: f32,
    ) -> Result<String, VisionError> {
        let resp: StartLabelResponse = self.call(
            "start_label_detection",
            &StartLabelRequest {
                video,
                min_confidence,
            },
        )?;
        Ok(resp.job_id)
    }

    fn get_label_detection(
        &self,
        job_id: &str,
        next_token: Option<&str>,
    ) -> Result<LabelPage, VisionError> {
        self.call(
            "get_label_detection",
            &GetLabelRequest { job_id, next_token },
        )
    }
}
