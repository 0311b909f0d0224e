//! Splitting of annotations whose position exceeds the API size limit.

use serde_json::{Map, Value};

/// Largest serialized `annotationPosition` the API accepts.
pub const MAX_POSITION_LENGTH: usize = 65_000;

/// Geometry key holding the splittable parts of a position.
fn geometry_key(annotation_type: &str) -> Option<&'static str> {
    match annotation_type {
        "highlight" | "underline" => Some("rects"),
        "ink" => Some("paths"),
        _ => None,
    }
}

fn position_length(position: &Map<String, Value>) -> usize {
    Value::Object(position.clone()).to_string().len()
}

/// Splits the position of an annotation into smaller positions.
///
/// Returns `None` when the annotation type has no splittable geometry, the
/// geometry consists of a single part, or a single part alone exceeds
/// [`MAX_POSITION_LENGTH`]. The returned positions keep the shape
/// of the input: a JSON string stays a JSON string.
pub fn split_position(annotation_type: &str, position: &Value) -> Option<Vec<Value>> {
    let geometry = geometry_key(annotation_type)?;
    let (parsed, as_string) = match position {
        Value::String(text) => (serde_json::from_str::<Value>(text).ok()?, true),
        Value::Object(_) => (position.clone(), false),
        _ => return None,
    };
    let map = parsed.as_object()?;
    let parts = map.get(geometry)?.as_array()?;
    if parts.len() < 2 {
        return None;
    }

    let with_parts = |parts: &[Value]| {
        let mut chunk = map.clone();
        chunk.insert(geometry.to_string(), Value::Array(parts.to_vec()));
        chunk
    };

    let mut chunks: Vec<Vec<Value>> = Vec::new();
    let mut current: Vec<Value> = Vec::new();
    for part in parts {
        current.push(part.clone());
        if current.len() > 1 && position_length(&with_parts(&current)) > MAX_POSITION_LENGTH {
            if let Some(last) = current.pop() {
                chunks.push(std::mem::take(&mut current));
                current.push(last);
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // The server rejected the whole position, so never hand it back unchanged.
    if chunks.len() == 1 {
        let middle = parts.len() / 2;
        chunks = vec![parts[..middle].to_vec(), parts[middle..].to_vec()];
    }

    // A single part over the limit would be rejected again on every pass.
    if chunks
        .iter()
        .any(|chunk| position_length(&with_parts(chunk)) > MAX_POSITION_LENGTH)
    {
        return None;
    }

    Some(
        chunks
            .iter()
            .map(|chunk| {
                let position = Value::Object(with_parts(chunk));
                if as_string {
                    Value::String(position.to_string())
                } else {
                    position
                }
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_rect_cannot_be_split() {
        let position = json!({"pageIndex": 0, "rects": [[1, 2, 3, 4]]});
        assert!(split_position("highlight", &position).is_none());
    }

    #[test]
    fn notes_cannot_be_split() {
        let position = json!({"pageIndex": 0, "rects": [[1, 2, 3, 4], [5, 6, 7, 8]]});
        assert!(split_position("note", &position).is_none());
    }

    #[test]
    fn small_position_is_halved() {
        let position = json!({"pageIndex": 3, "rects": [[1, 2, 3, 4], [5, 6, 7, 8], [9, 9, 9, 9]]});
        let split = split_position("highlight", &position).unwrap();
        assert_eq!(split.len(), 2);
        assert_eq!(split[0]["rects"].as_array().unwrap().len(), 1);
        assert_eq!(split[1]["rects"].as_array().unwrap().len(), 2);
        assert_eq!(split[1]["pageIndex"], 3);
    }

    #[test]
    fn large_ink_is_split_under_limit() {
        let path: Vec<f64> = (0..2000).map(|value| value as f64 + 0.125).collect();
        let paths: Vec<Value> = (0..10).map(|_| json!(path)).collect();
        let position = json!({"pageIndex": 0, "width": 2, "paths": paths}).to_string();

        let split = split_position("ink", &Value::String(position)).unwrap();
        assert!(split.len() > 1);
        for chunk in &split {
            let text = chunk.as_str().unwrap();
            assert!(text.len() <= MAX_POSITION_LENGTH);
        }
    }

    #[test]
    fn oversized_single_path_cannot_be_split() {
        let huge: Vec<f64> = (0..20_000).map(|value| value as f64 + 0.125).collect();
        let position = json!({"pageIndex": 0, "width": 2, "paths": [[1.0, 2.0], huge, [3.0, 4.0]]});
        assert!(split_position("ink", &position).is_none());
    }

    proptest::proptest! {
        #[test]
        fn split_keeps_every_rect_in_order(count in 2usize..40) {
            let rects: Vec<Value> = (0..count).map(|index| json!([index, index, index, index])).collect();
            let position = json!({"pageIndex": 0, "rects": rects.clone()});

            let split = split_position("underline", &position).unwrap();
            proptest::prop_assert!(split.len() >= 2);
            let joined: Vec<Value> = split
                .iter()
                .flat_map(|chunk| chunk["rects"].as_array().cloned().unwrap_or_default())
                .collect();
            proptest::prop_assert_eq!(joined, rects);
        }
    }
}
