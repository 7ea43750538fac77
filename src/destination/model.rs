use serde::Deserialize;
use serde_json::Value;

/// List endpoints answer either with a bare array or a paged envelope.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum ListResponse {
    Bare(Vec<Value>),
    Data { data: Vec<Value> },
    Items { items: Vec<Value> },
}

impl ListResponse {
    pub fn into_records(self) -> Vec<Value> {
        match self {
            ListResponse::Bare(v) => v,
            ListResponse::Data { data } => data,
            ListResponse::Items { items } => items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_all_envelopes() {
        let bare: ListResponse = serde_json::from_value(json!([{ "_id": "a" }])).unwrap();
        assert_eq!(bare.into_records().len(), 1);
        let data: ListResponse =
            serde_json::from_value(json!({ "data": [{ "_id": "a" }, { "_id": "b" }] })).unwrap();
        assert_eq!(data.into_records().len(), 2);
        let items: ListResponse = serde_json::from_value(json!({ "items": [] })).unwrap();
        assert!(items.into_records().is_empty());
    }
}
