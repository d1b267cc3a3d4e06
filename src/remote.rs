//! Client bindings for the remote object-store and calculation API.
//!
//! The remote exposes an HTTP API split across services: IAM (contexts),
//! ISS (immutable storage), APM (app manifests), and calc (calculation
//! status). Everything here goes through [`ServiceCore::async_http_request`],
//! so the exchanges run on the HTTP pool, reuse its persistent connections,
//! and can be scripted against the mock session in tests. All requests
//! carry a bearer token; payloads are JSON or MessagePack.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::codec;
use crate::errors::{labels, Error, ErrorKind, Result};
use crate::http::{HttpRequest, HttpResponse};
use crate::service::ServiceCore;
use crate::value::{Blob, Value};

/// An authenticated session against one remote deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    /// Base URL of the API, e.g. `http://api.example.test/api/v1.0`.
    pub api_url: String,
    pub access_token: String,
}

fn authorize(session: &RemoteSession, request: HttpRequest) -> HttpRequest {
    request.with_header(
        "Authorization",
        format!("Bearer {}", session.access_token),
    )
}

fn parse_json<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
    serde_json::from_slice(response.body.as_slice())
        .map_err(|e| Error::new(ErrorKind::Parse).with_info(labels::INTERNAL_MESSAGE, e))
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

/// Resolves an object id to the id of its current immutable value.
pub async fn resolve_object_to_immutable(
    core: &ServiceCore,
    session: &RemoteSession,
    context_id: &str,
    object_id: &str,
    ignore_upgrades: bool,
) -> Result<String> {
    let request = HttpRequest::get(format!(
        "{}/iss/{}/immutable?context={}&ignore_upgrades={}",
        session.api_url, object_id, context_id, ignore_upgrades
    ));
    let response = core.async_http_request(authorize(session, request)).await?;
    Ok(parse_json::<IdResponse>(&response)?.id)
}

/// Fetches an object's metadata, which the remote reports as headers.
pub async fn get_object_metadata(
    core: &ServiceCore,
    session: &RemoteSession,
    context_id: &str,
    object_id: &str,
) -> Result<Vec<(String, String)>> {
    let request = HttpRequest::new(
        http::Method::HEAD,
        format!(
            "{}/iss/{}?context={}",
            session.api_url, object_id, context_id
        ),
    );
    let response = core.async_http_request(authorize(session, request)).await?;
    Ok(response.headers)
}

/// Retrieves an immutable value, as MessagePack, and decodes it.
pub async fn retrieve_immutable(
    core: &ServiceCore,
    session: &RemoteSession,
    context_id: &str,
    immutable_id: &str,
) -> Result<Value> {
    let blob = retrieve_immutable_blob(core, session, context_id, immutable_id).await?;
    codec::msgpack_to_value(blob.as_slice())
}

/// Retrieves an immutable value as its raw MessagePack blob.
pub async fn retrieve_immutable_blob(
    core: &ServiceCore,
    session: &RemoteSession,
    context_id: &str,
    immutable_id: &str,
) -> Result<Blob> {
    let request = HttpRequest::get(format!(
        "{}/iss/immutable/{}?context={}",
        session.api_url, immutable_id, context_id
    ))
    .with_header("Accept", "application/octet-stream");
    let response = core.async_http_request(authorize(session, request)).await?;
    Ok(response.body)
}

/// Posts an object of the given schema and returns its id.
pub async fn post_object(
    core: &ServiceCore,
    session: &RemoteSession,
    context_id: &str,
    schema: &str,
    value: &Value,
) -> Result<String> {
    post_object_blob(
        core,
        session,
        context_id,
        schema,
        Blob::from(codec::value_to_msgpack(value)?),
    )
    .await
}

/// Posts an object already encoded as MessagePack.
pub async fn post_object_blob(
    core: &ServiceCore,
    session: &RemoteSession,
    context_id: &str,
    schema: &str,
    msgpack_data: Blob,
) -> Result<String> {
    let request = HttpRequest::post(
        format!(
            "{}/iss/{}?context={}",
            session.api_url, schema, context_id
        ),
        msgpack_data,
    )
    .with_header("Content-Type", "application/octet-stream");
    let response = core.async_http_request(authorize(session, request)).await?;
    Ok(parse_json::<IdResponse>(&response)?.id)
}

/// Status of a remote calculation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationStatus {
    Queued,
    Calculating { progress: f64 },
    Completed,
    Failed { message: String },
}

/// Queries a calculation's current status.
pub async fn get_calculation_status(
    core: &ServiceCore,
    session: &RemoteSession,
    context_id: &str,
    calculation_id: &str,
) -> Result<CalculationStatus> {
    let request = HttpRequest::get(format!(
        "{}/calc/{}/status?context={}",
        session.api_url, calculation_id, context_id
    ));
    let response = core.async_http_request(authorize(session, request)).await?;
    parse_json(&response)
}

/// Long-polls a calculation's status: the remote answers as soon as the
/// status reaches `completed`, the given progress, or the timeout.
pub async fn long_poll_calculation_status(
    core: &ServiceCore,
    session: &RemoteSession,
    context_id: &str,
    calculation_id: &str,
    progress_threshold: f64,
    timeout_seconds: u32,
) -> Result<CalculationStatus> {
    let request = HttpRequest::get(format!(
        "{}/calc/{}/status?context={}&status=completed&progress={}&timeout={}",
        session.api_url, calculation_id, context_id, progress_threshold, timeout_seconds
    ));
    let response = core.async_http_request(authorize(session, request)).await?;
    parse_json(&response)
}

/// Fetches an app version's manifest.
pub async fn get_app_manifest(
    core: &ServiceCore,
    session: &RemoteSession,
    account: &str,
    app: &str,
    version: &str,
) -> Result<Value> {
    let request = HttpRequest::get(format!(
        "{}/apm/apps/{}/{}/versions/{}?include_manifest=true",
        session.api_url, account, app, version
    ));
    let response = core.async_http_request(authorize(session, request)).await?;
    response.parse_json_body()
}

/// One app pinned inside a context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextApp {
    pub account: String,
    pub app: String,
    pub version: String,
}

/// The contents of an execution context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextContents {
    pub bucket: String,
    pub contents: Vec<ContextApp>,
}

/// Fetches what a context contains.
pub async fn get_context_contents(
    core: &ServiceCore,
    session: &RemoteSession,
    context_id: &str,
) -> Result<ContextContents> {
    let request = HttpRequest::get(format!(
        "{}/iam/contexts/{}",
        session.api_url, context_id
    ));
    let response = core.async_http_request(authorize(session, request)).await?;
    parse_json(&response)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ServiceConfig;
    use crate::http::{MockHttpExchange, MockHttpSession};

    fn test_session() -> RemoteSession {
        RemoteSession {
            api_url: "http://remote.test/api/v1.0".to_owned(),
            access_token: "xyz".to_owned(),
        }
    }

    fn mocked_core() -> (ServiceCore, Arc<MockHttpSession>) {
        let core = ServiceCore::new(ServiceConfig::default());
        let session = core.enable_http_mocking();
        (core, session)
    }

    #[tokio::test]
    async fn resolves_objects_to_immutables() {
        let (core, mock) = mocked_core();
        mock.set_script(vec![MockHttpExchange {
            request: HttpRequest::get(
                "http://remote.test/api/v1.0/iss/obj123/immutable?context=ctx1&ignore_upgrades=false",
            )
            .with_header("Authorization", "Bearer xyz"),
            response: HttpResponse::ok(Blob::from(br#"{"id": "imm456"}"#.to_vec())),
        }]);

        let immutable_id = resolve_object_to_immutable(
            &core,
            &test_session(),
            "ctx1",
            "obj123",
            false,
        )
        .await
        .unwrap();
        assert_eq!(immutable_id, "imm456");
        assert!(mock.is_complete());
        assert!(mock.is_in_order());
    }

    #[tokio::test]
    async fn retrieves_and_posts_immutables_as_msgpack() {
        let (core, mock) = mocked_core();
        let payload = Value::List(vec![Value::from(1i64), Value::from("two")]);
        let encoded = codec::value_to_msgpack(&payload).unwrap();
        mock.set_script(vec![
            MockHttpExchange {
                request: HttpRequest::get(
                    "http://remote.test/api/v1.0/iss/immutable/imm456?context=ctx1",
                )
                .with_header("Accept", "application/octet-stream")
                .with_header("Authorization", "Bearer xyz"),
                response: HttpResponse::ok(Blob::from(encoded.clone())),
            },
            MockHttpExchange {
                request: HttpRequest::post(
                    "http://remote.test/api/v1.0/iss/list/integer?context=ctx1",
                    Blob::from(encoded),
                )
                .with_header("Content-Type", "application/octet-stream")
                .with_header("Authorization", "Bearer xyz"),
                response: HttpResponse::ok(Blob::from(br#"{"id": "obj789"}"#.to_vec())),
            },
        ]);

        let value = retrieve_immutable(&core, &test_session(), "ctx1", "imm456")
            .await
            .unwrap();
        assert_eq!(value, payload);

        let posted = post_object(&core, &test_session(), "ctx1", "list/integer", &payload)
            .await
            .unwrap();
        assert_eq!(posted, "obj789");
        assert!(mock.is_complete());
        assert!(mock.is_in_order());
    }

    #[tokio::test]
    async fn calculation_status_decodes_every_variant() {
        let (core, mock) = mocked_core();
        mock.set_script(vec![
            MockHttpExchange {
                request: HttpRequest::get(
                    "http://remote.test/api/v1.0/calc/calc1/status?context=ctx1",
                )
                .with_header("Authorization", "Bearer xyz"),
                response: HttpResponse::ok(Blob::from(br#""queued""#.to_vec())),
            },
            MockHttpExchange {
                request: HttpRequest::get(
                    "http://remote.test/api/v1.0/calc/calc1/status?context=ctx1&status=completed&progress=0.5&timeout=30",
                )
                .with_header("Authorization", "Bearer xyz"),
                response: HttpResponse::ok(Blob::from(
                    br#"{"calculating": {"progress": 0.25}}"#.to_vec(),
                )),
            },
        ]);

        let status = get_calculation_status(&core, &test_session(), "ctx1", "calc1")
            .await
            .unwrap();
        assert_eq!(status, CalculationStatus::Queued);

        let status = long_poll_calculation_status(
            &core,
            &test_session(),
            "ctx1",
            "calc1",
            0.5,
            30,
        )
        .await
        .unwrap();
        assert_eq!(status, CalculationStatus::Calculating { progress: 0.25 });
    }

    #[tokio::test]
    async fn context_contents_parse() {
        let (core, mock) = mocked_core();
        mock.set_script(vec![MockHttpExchange {
            request: HttpRequest::get("http://remote.test/api/v1.0/iam/contexts/ctx1")
                .with_header("Authorization", "Bearer xyz"),
            response: HttpResponse::ok(Blob::from(
                br#"{"bucket": "main", "contents": [{"account": "acme", "app": "calcs", "version": "1.2.0"}]}"#
                    .to_vec(),
            )),
        }]);

        let contents = get_context_contents(&core, &test_session(), "ctx1")
            .await
            .unwrap();
        assert_eq!(contents.bucket, "main");
        assert_eq!(
            contents.contents,
            vec![ContextApp {
                account: "acme".to_owned(),
                app: "calcs".to_owned(),
                version: "1.2.0".to_owned(),
            }]
        );
    }
}
