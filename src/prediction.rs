use serde_json::Value;

/// One tracked subject in the current frame, normalized from the wire
/// payload. Coordinates are in source-frame pixel space with x1 <= x2 and
/// y1 <= y2. Confidence is the raw service output and is deliberately not
/// clamped to [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub track_id: String,
    pub name: String,
    pub confidence: f64,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// Decoded inference response: the set of departed names in this frame plus
/// the per-track predictions. Rebuilt wholesale on every response.
#[derive(Debug, Clone, Default)]
pub struct InferenceResponse {
    pub exit_ids: Vec<String>,
    pub predictions: Vec<PredictionRecord>,
}

/// Normalizes a decoded wire payload into canonical records. Malformed
/// entries are logged and skipped; this never fails as a whole.
pub fn process_response(payload: &Value) -> InferenceResponse {
    let exit_ids = payload
        .get("exit_ids")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();

    let mut predictions = Vec::new();
    if let Some(entries) = payload.get("predictions").and_then(Value::as_object) {
        for (track_id, entry) in entries {
            match process_entry(track_id, entry) {
                Some(record) => predictions.push(record),
                None => {
                    tracing::warn!(track_id, "dropping malformed prediction entry");
                }
            }
        }
    }

    InferenceResponse {
        exit_ids,
        predictions,
    }
}

/// Wire shape is a positional array: [name, confidence, x1, y1, x2, y2].
fn process_entry(track_id: &str, entry: &Value) -> Option<PredictionRecord> {
    let fields = entry.as_array()?;
    if fields.len() < 6 {
        return None;
    }

    let name = match &fields[0] {
        Value::String(s) => s.clone(),
        Value::Null => "Unknown".to_string(),
        other => other.to_string(),
    };
    let confidence = coerce_number(&fields[1])?;
    let mut x1 = coerce_number(&fields[2])?;
    let mut y1 = coerce_number(&fields[3])?;
    let mut x2 = coerce_number(&fields[4])?;
    let mut y2 = coerce_number(&fields[5])?;

    if x1 > x2 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y1 > y2 {
        std::mem::swap(&mut y1, &mut y2);
    }

    Some(PredictionRecord {
        track_id: track_id.to_string(),
        name,
        confidence,
        x1,
        y1,
        x2,
        y2,
    })
}

/// The service serializes numpy scalars; numbers occasionally arrive as
/// strings, so accept both.
fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalizes_swapped_coordinates() {
        let payload = json!({
            "predictions": { "7": ["Alice", 0.92, 50, 80, 10, 200] }
        });
        let response = process_response(&payload);
        assert_eq!(response.predictions.len(), 1);
        let record = &response.predictions[0];
        assert_eq!(record.track_id, "7");
        assert_eq!(record.name, "Alice");
        assert_eq!(record.confidence, 0.92);
        assert_eq!(record.x1, 10.0);
        assert_eq!(record.x2, 50.0);
        assert_eq!(record.y1, 80.0);
        assert_eq!(record.y2, 200.0);
    }

    #[test]
    fn test_short_entry_dropped_others_kept() {
        let payload = json!({
            "predictions": {
                "1": ["Bob", 0.5, 0, 0],
                "2": ["Carol", 0.8, 1, 2, 3, 4]
            }
        });
        let response = process_response(&payload);
        assert_eq!(response.predictions.len(), 1);
        assert_eq!(response.predictions[0].track_id, "2");
        assert_eq!(response.predictions[0].name, "Carol");
    }

    #[test]
    fn test_non_array_entry_dropped() {
        let payload = json!({
            "predictions": { "1": {"name": "Bob"}, "2": null }
        });
        let response = process_response(&payload);
        assert!(response.predictions.is_empty());
    }

    #[test]
    fn test_non_numeric_coordinate_rejects_entry() {
        let payload = json!({
            "predictions": { "1": ["Bob", 0.5, "left", 0, 10, 10] }
        });
        let response = process_response(&payload);
        assert!(response.predictions.is_empty());
    }

    #[test]
    fn test_string_numbers_coerced() {
        let payload = json!({
            "predictions": { "3": ["Dee", "0.75", "12", "20", "40", "60"] }
        });
        let response = process_response(&payload);
        let record = &response.predictions[0];
        assert_eq!(record.confidence, 0.75);
        assert_eq!(record.x1, 12.0);
        assert_eq!(record.y2, 60.0);
    }

    #[test]
    fn test_confidence_not_clamped() {
        let payload = json!({
            "predictions": { "4": ["Eve", 1.7, 0, 0, 5, 5] }
        });
        let response = process_response(&payload);
        assert_eq!(response.predictions[0].confidence, 1.7);
    }

    #[test]
    fn test_null_name_maps_to_unknown() {
        let payload = json!({
            "predictions": { "5": [null, 0.1, 0, 0, 5, 5] }
        });
        let response = process_response(&payload);
        assert_eq!(response.predictions[0].name, "Unknown");
    }

    #[test]
    fn test_null_exit_ids_treated_as_empty() {
        let payload = json!({ "exit_ids": null, "predictions": {} });
        let response = process_response(&payload);
        assert!(response.exit_ids.is_empty());
    }

    #[test]
    fn test_exit_ids_extracted() {
        let payload = json!({ "exit_ids": ["Alice", "Bob"], "predictions": {} });
        let response = process_response(&payload);
        assert_eq!(response.exit_ids, vec!["Alice", "Bob"]);
    }
}
