use serde::{Deserialize, Serialize};

use crate::backends::BackendKind;
use crate::labels::OctLabel;
use crate::report::Record;

/// Body of a successful `/predict` call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResponse {
    pub uploaded_image_url: String,
    pub grad_cam_image_url: String,
    pub predicted_label: OctLabel,
    /// Starts equal to the prediction; clinicians may override it later.
    pub assigned_label: OctLabel,
    pub prediction_confidence: f64,
    pub filename: String,
    /// `"true"` or `"false"`, kept as text for the frontend.
    pub is_confirmed: String,
    pub inference_time: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub prediction_data: Vec<Record>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub report_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub backends: Vec<BackendKind>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prediction_response_uses_frontend_field_names() {
        let response = PredictionResponse {
            uploaded_image_url: "u".into(),
            grad_cam_image_url: "g".into(),
            predicted_label: OctLabel::Dme,
            assigned_label: OctLabel::Dme,
            prediction_confidence: 70.0,
            filename: "scan.png".into(),
            is_confirmed: "false".into(),
            inference_time: 0.25,
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "uploadedImageUrl": "u",
                "gradCamImageUrl": "g",
                "predictedLabel": "DME",
                "assignedLabel": "DME",
                "predictionConfidence": 70.0,
                "filename": "scan.png",
                "isConfirmed": "false",
                "inferenceTime": 0.25,
            })
        );
    }

    #[test]
    fn report_request_reads_prediction_data() {
        let request: ReportRequest = serde_json::from_value(json!({
            "predictionData": [{"filename": "a.png", "predictedLabel": "CNV"}]
        }))
        .unwrap();
        assert_eq!(request.prediction_data.len(), 1);
        assert_eq!(request.prediction_data[0]["filename"], "a.png");
    }
}
