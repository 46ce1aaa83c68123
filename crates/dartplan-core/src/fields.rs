// Defensive field extraction from loosely-typed Hub JSON.
//
// The Hub sends the same logical field sometimes as a JSON number and
// sometimes as a numeric string, and nests payloads inconsistently. These
// helpers search an ordered list of candidate objects and accept either
// representation. Missing or unparseable values fall back to defaults.

use serde_json::{Map, Value};

/// An ordered list of JSON objects to search, first match wins.
#[derive(Debug, Clone, Default)]
pub struct Candidates<'a> {
    objects: Vec<&'a Map<String, Value>>,
    /// Leading objects that belong to the update payload rather than the
    /// message envelope.
    payload: usize,
}

impl<'a> Candidates<'a> {
    /// Build the standard search order for a message: the nested `update`
    /// object, the nested `result` object, then the message itself.
    ///
    /// When the message wraps its payload under `matchUpdate` (or `result`
    /// holds the whole payload), the wrapped object is searched the same way
    /// before the outer root.
    pub fn for_message(root: &'a Value) -> Self {
        let mut out = Candidates::default();
        let Some(root_obj) = root.as_object() else {
            return out;
        };
        let base = root_obj
            .get("matchUpdate")
            .and_then(Value::as_object)
            .unwrap_or(root_obj);

        for key in ["update", "result"] {
            if let Some(obj) = base.get(key).and_then(Value::as_object) {
                out.push(obj);
            }
        }
        let wrapped = !std::ptr::eq(base, root_obj);
        if wrapped {
            out.push(base);
        }
        out.payload = out.objects.len();
        out.push(root_obj);
        out
    }

    /// Only the payload objects, without the message envelope. Use this for
    /// keys as generic as `id` that the envelope may carry for itself.
    pub fn payload(&self) -> Candidates<'a> {
        let objects = self.objects[..self.payload].to_vec();
        Candidates {
            payload: objects.len(),
            objects,
        }
    }

    pub fn push(&mut self, obj: &'a Map<String, Value>) {
        self.objects.push(obj);
    }

    /// First value found under any of `keys`, searching candidates in order.
    pub fn get(&self, keys: &[&str]) -> Option<&'a Value> {
        self.objects
            .iter()
            .copied()
            .flat_map(|obj| keys.iter().filter_map(move |k| obj.get(*k)))
            .find(|v| !v.is_null())
    }

    /// First value under `keys` that reads as a non-negative integer.
    pub fn u32_field(&self, keys: &[&str]) -> u32 {
        self.objects
            .iter()
            .copied()
            .flat_map(|obj| keys.iter().filter_map(move |k| obj.get(*k)))
            .find_map(value_as_u32)
            .unwrap_or(0)
    }

    /// First value under `keys` that reads as a non-empty string. Numbers are
    /// rendered as their decimal text.
    pub fn string_field(&self, keys: &[&str]) -> Option<String> {
        self.objects
            .iter()
            .copied()
            .flat_map(|obj| keys.iter().filter_map(move |k| obj.get(*k)))
            .find_map(value_as_string)
    }

    /// True if any value under `keys` reads as true.
    pub fn flag(&self, keys: &[&str]) -> bool {
        self.objects
            .iter()
            .copied()
            .flat_map(|obj| keys.iter().filter_map(move |k| obj.get(*k)))
            .any(value_as_bool)
    }
}

pub fn value_as_u32(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

pub fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn value_as_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_u64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}
