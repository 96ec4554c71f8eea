#![cfg(feature = "web")]

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use chrono::{Duration, Utc};
use flashdash::app::{AppState, router};
use flashdash::config::Config;
use flashdash::projects::ProjectStore;
use flashdash::storage::MemoryStore;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

const USER_HEADER: &str = "X-Auth-Request-Email";
const BOUNDARY: &str = "flashdash-test-boundary";

fn app() -> Router {
    app_with(Config::default())
}

fn app_with(config: Config) -> Router {
    let projects = ProjectStore::new(Arc::new(MemoryStore::new()));
    router(Arc::new(AppState::new(config, projects)))
}

/// A browser: one identity and whatever workspace cookie the server handed out.
struct Client {
    app: Router,
    cookie: Option<String>,
}

struct Reply {
    status: StatusCode,
    headers: header::HeaderMap,
    body: Vec<u8>,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn text(&self) -> String {
        String::from_utf8(self.body.clone()).unwrap()
    }
}

impl Client {
    fn new(app: Router) -> Self {
        Client { app, cookie: None }
    }

    async fn send(&mut self, method: Method, uri: &str, content_type: &str, body: Vec<u8>) -> Reply {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, "ada@example.com");
        if !content_type.is_empty() {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        if let Some(cookie) = &self.cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let response = self
            .app
            .clone()
            .oneshot(builder.body(Body::from(body)).unwrap())
            .await
            .unwrap();

        if let Some(set) = response.headers().get(header::SET_COOKIE) {
            let pair = set.to_str().unwrap().split(';').next().unwrap();
            self.cookie = Some(pair.to_string());
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        Reply {
            status,
            headers,
            body,
        }
    }

    async fn get(&mut self, uri: &str) -> Reply {
        self.send(Method::GET, uri, "", Vec::new()).await
    }

    async fn post_json(&mut self, uri: &str, body: Value) -> Reply {
        self.send(Method::POST, uri, "application/json", body.to_string().into_bytes())
            .await
    }

    async fn upload(&mut self, files: &[(&str, &str)]) -> Reply {
        let mut body = String::new();
        // an empty selection still posts one nameless part, as browsers do
        let empty: &[(&str, &str)] = &[("", "")];
        let parts = if files.is_empty() { empty } else { files };
        for (name, content) in parts {
            body.push_str(&format!(
                "--{}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\nContent-Type: text/csv\r\n\r\n{}\r\n",
                BOUNDARY, name, content
            ));
        }
        body.push_str(&format!("--{}--\r\n", BOUNDARY));
        let content_type = format!("multipart/form-data; boundary={}", BOUNDARY);
        self.send(Method::POST, "/api/workspace/uploads", &content_type, body.into_bytes())
            .await
    }
}

const NORTH: &str = "month,total\n1,10\n2,14\n";
const SOUTH: &str = "month,total\n1,7\n2,3\n";

#[tokio::test]
async fn health_is_open_but_api_needs_identity() {
    let app = app();
    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::get("/api/workspace").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn workspaces_are_per_browser() {
    let app = app();
    let mut first = Client::new(app.clone());
    let mut second = Client::new(app);

    first.get("/api/workspace").await;
    first.upload(&[("north.csv", NORTH)]).await;
    second.get("/api/workspace").await;

    assert_ne!(first.cookie, second.cookie);
    let view = second.get("/api/workspace").await.json();
    assert_eq!(view["datasets"].as_array().unwrap().len(), 0);
    assert_eq!(view["can_run"], json!(false));
}

#[tokio::test]
async fn upload_run_export_and_figure() {
    let mut client = Client::new(app());

    let view = client
        .upload(&[("north.csv", NORTH), ("south.csv", SOUTH)])
        .await
        .json();
    assert_eq!(view["datasets"].as_array().unwrap().len(), 2);
    assert_eq!(view["combined_rows"], json!(4));
    assert_eq!(view["can_run"], json!(true));

    let code = r#"let fig = px::bar(df_all, "month", "total", "__source__");
print(df_all.rows);"#;
    let view = client
        .post_json("/api/workspace/run", json!({ "code": code }))
        .await
        .json();
    let run = &view["last_run"];
    assert_eq!(run["outcome"]["status"], json!("completed"));
    assert_eq!(run["output"], json!(["4"]));
    assert!(run["hint"].as_str().unwrap().starts_with("Multiple files"));

    let figure = client.get("/api/workspace/figure.html").await;
    assert_eq!(figure.status, StatusCode::OK);
    assert!(figure.text().contains("<svg"));

    let csv = client.get("/api/workspace/export?format=csv").await;
    assert_eq!(csv.status, StatusCode::OK);
    assert_eq!(csv.headers[header::CONTENT_TYPE], "text/csv");
    assert!(csv.text().starts_with("month,total,__source__\n"));

    let bad = client.get("/api/workspace/export?format=parquet").await;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    assert_eq!(bad.json()["status"], json!("error"));

    // deselecting a file re-runs the committed snippet on what is left
    let view = client.upload(&[("south.csv", SOUTH)]).await.json();
    assert_eq!(view["last_run"]["output"], json!(["2"]));
}

#[tokio::test]
async fn denied_import_is_reported() {
    let mut client = Client::new(app());
    client.upload(&[("north.csv", NORTH)]).await;

    let view = client
        .post_json("/api/workspace/run", json!({ "code": "import \"os\" as os;\nprint(1);" }))
        .await
        .json();
    assert_eq!(view["last_run"]["outcome"]["status"], json!("denied"));
    assert_eq!(view["last_run"]["outcome"]["module"], json!("os"));
    assert_eq!(view["last_run"]["output"], json!([]));
}

#[tokio::test]
async fn run_without_data_is_refused() {
    let mut client = Client::new(app());
    let view = client
        .post_json("/api/workspace/run", json!({ "code": "print(1);" }))
        .await
        .json();
    assert_eq!(view["snippet"], Value::Null);
    assert_eq!(view["last_run"], Value::Null);
    assert_eq!(view["notices"][0]["level"], json!("warning"));

    let export = client.get("/api/workspace/export").await;
    assert_eq!(export.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn project_lifecycle() {
    let mut client = Client::new(app());
    client
        .upload(&[("north.csv", NORTH), ("south.csv", SOUTH)])
        .await;
    let code = "print(df_all.sum(\"total\"));";
    client
        .post_json("/api/workspace/run", json!({ "code": code }))
        .await;

    let saved = client
        .post_json("/api/workspace/save", json!({ "author": " Ada ", "name": "Totals" }))
        .await;
    assert_eq!(saved.status, StatusCode::OK);
    let saved = saved.json();
    let id = saved["id"].as_str().unwrap().to_string();
    assert_eq!(saved["workspace"]["loaded_project"], json!(id));
    assert_eq!(saved["workspace"]["save_form_open"], json!(false));

    let list = client.get("/api/projects").await.json();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["author"], json!("Ada"));
    assert_eq!(list[0]["badge"], json!("🟢 3 mo"));

    let view = client
        .post_json("/api/workspace/reset", json!({}))
        .await
        .json();
    assert_eq!(view["datasets"].as_array().unwrap().len(), 0);
    assert_eq!(view["loaded_project"], Value::Null);

    let view = client
        .post_json(&format!("/api/projects/{}/load", id), json!({}))
        .await
        .json();
    assert_eq!(view["snippet"], json!(code));
    assert_eq!(view["datasets"][0]["name"], json!("north.csv"));
    assert_eq!(view["datasets"][1]["name"], json!("south.csv"));
    assert_eq!(view["uploader_active"], json!(false));
    assert_eq!(view["last_run"]["output"], json!(["34.0"]));

    // an empty uploader after a load keeps the project's data
    let view = client.upload(&[]).await.json();
    assert_eq!(view["datasets"].as_array().unwrap().len(), 2);

    let updated = client
        .post_json("/api/workspace/update", json!({ "name": "Totals v2" }))
        .await;
    assert_eq!(updated.status, StatusCode::OK);
    let list = client.get("/api/projects?q=v2").await.json();
    assert_eq!(list[0]["name"], json!("Totals v2"));

    let download = client.get(&format!("/api/projects/{}/download", id)).await;
    assert_eq!(download.status, StatusCode::OK);
    assert_eq!(download.headers[header::CONTENT_TYPE], "application/gzip");

    let uri = format!("/api/projects/{}", id);
    let refused = client.send(Method::DELETE, &uri, "", Vec::new()).await;
    assert_eq!(refused.status, StatusCode::BAD_REQUEST);

    client
        .post_json(&format!("/api/projects/{}/delete-request", id), json!({}))
        .await;
    let deleted = client.send(Method::DELETE, &uri, "", Vec::new()).await;
    assert_eq!(deleted.status, StatusCode::OK);
    assert_eq!(deleted.json()["loaded_project"], Value::Null);

    let list = client.get("/api/projects").await.json();
    assert!(list.as_array().unwrap().is_empty());
    let gone = client
        .post_json(&format!("/api/projects/{}/load", id), json!({}))
        .await;
    assert_eq!(gone.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expiry_can_be_disabled_and_reenabled() {
    let mut client = Client::new(app());
    client.upload(&[("north.csv", NORTH)]).await;
    let id = client
        .post_json("/api/workspace/save", json!({ "author": "Ada", "name": "Keep" }))
        .await
        .json()["id"]
        .as_str()
        .unwrap()
        .to_string();
    let uri = format!("/api/projects/{}/expiry", id);

    let never = client
        .send(Method::PUT, &uri, "application/json", json!({ "expires_at": "never" }).to_string().into_bytes())
        .await
        .json();
    assert_eq!(never["expires_at"], json!("never"));
    assert_eq!(never["badge"], json!("♾️ never"));
    let list = client.get("/api/projects").await.json();
    assert_eq!(list[0]["badge"], json!("♾️ never"));

    let again = client
        .send(Method::PUT, &uri, "application/json", json!({ "expires_at": null }).to_string().into_bytes())
        .await
        .json();
    let expected = (Utc::now().date_naive() + Duration::days(90))
        .format("%Y-%m-%d")
        .to_string();
    assert_eq!(again["expires_at"], json!(expected));

    let bad = client
        .send(Method::PUT, &uri, "application/json", json!({ "expires_at": "soon" }).to_string().into_bytes())
        .await;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn save_needs_both_names() {
    let mut client = Client::new(app());
    client.upload(&[("north.csv", NORTH)]).await;
    let reply = client
        .post_json("/api/workspace/save", json!({ "author": "Ada", "name": "  " }))
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["message"], json!("Invalid input: Please fill in both fields."));
}

fn big_csv(rows: usize) -> String {
    let filler = "x".repeat(90);
    let mut csv = String::from("id,notes\n");
    for i in 0..rows {
        csv.push_str(&format!("{},{}\n", i, filler));
    }
    csv
}

#[tokio::test]
async fn uploads_above_two_megabytes_are_ingested() {
    let csv = big_csv(30_000);
    assert!(csv.len() > 2 * 1024 * 1024);

    let mut client = Client::new(app());
    let reply = client.upload(&[("big.csv", csv.as_str())]).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["datasets"][0]["rows"], json!(30_000));
}

#[tokio::test]
async fn upload_limit_is_configurable() {
    let config = Config {
        max_upload_mb: 1,
        ..Config::default()
    };
    let mut client = Client::new(app_with(config));
    let reply = client.upload(&[("big.csv", big_csv(15_000).as_str())]).await;
    assert!(reply.status.is_client_error());
}
