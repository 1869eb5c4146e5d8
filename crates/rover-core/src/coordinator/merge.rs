use serde_json::Value;

/// Recursive key-wise merge. Objects merge key by key; any other patch value
/// (scalar, array, null) replaces the base value. Keys absent from the patch
/// are preserved.
pub fn merge(base: &Value, patch: &Value) -> Value {
    let mut out = base.clone();
    merge_into(&mut out, patch);
    out
}

pub fn merge_into(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
