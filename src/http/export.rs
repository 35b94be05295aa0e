//! The VRP JSON export endpoint.

use hyper::{Body, Method, Request};
use serde::Serialize;

use crate::payload::SharedHistory;

use super::response::{ContentType, Response, ResponseBuilder};

pub async fn handle_get_or_head(
    req: &Request<Body>,
    history: &SharedHistory,
) -> Option<Response> {
    if req.uri().path() != "/json" && req.uri().path() != "/api/v1/vrps.json" {
        return None;
    }
    let head = *req.method() == Method::HEAD;
    if *req.method() != Method::GET && *req.method() != Method::HEAD {
        return Some(Response::method_not_allowed());
    }
    if head {
        return Some(ResponseBuilder::ok().content_type(ContentType::JSON).body(""));
    }

    let history = history.read().await;
    let roas: Vec<ExportRoa> = history.current().iter().map(ExportRoa::from).collect();
    let document = ExportDocument {
        metadata: ExportMetadata {
            generated: chrono::Utc::now().timestamp(),
            session_id: history.session_id(),
            serial: u32::from(history.serial()),
            counts: roas.len(),
            buildtime: history.buildtime().map(str::to_string),
        },
        roas,
    };
    let body = serde_json::to_string(&document)
        .expect("VRP export document is always serializable");
    Some(ResponseBuilder::ok().content_type(ContentType::JSON).body(body))
}


#[derive(Serialize)]
struct ExportDocument {
    metadata: ExportMetadata,
    roas: Vec<ExportRoa>,
}

#[derive(Serialize)]
struct ExportMetadata {
    generated: i64,
    #[serde(rename = "sessionId")]
    session_id: u16,
    serial: u32,
    counts: usize,
    buildtime: Option<String>,
}

#[derive(Serialize)]
struct ExportRoa {
    prefix: String,
    asn: String,
    #[serde(rename = "maxLength")]
    max_length: u8,
}

impl From<&crate::vrp::Vrp> for ExportRoa {
    fn from(vrp: &crate::vrp::Vrp) -> Self {
        ExportRoa {
            prefix: vrp.prefix.to_string(),
            asn: format!("AS{}", vrp.asn),
            max_length: vrp.max_length,
        }
    }
}
