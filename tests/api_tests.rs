
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use hub_satellite::api::{self, MAX_INLINE_LOG};
use hub_satellite::Satellite;
use test_harness::TestEnv;

async fn app(env: &TestEnv) -> (Router, Satellite) {
    let satellite = Satellite::start(env.config.clone()).await.unwrap();
    (api::router(satellite.api_state()), satellite)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post(app: &Router, uri: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

async fn run(app: &Router, body: Value) -> (String, Vec<String>) {
    let (status, value) = post(app, "/run", &body.to_string()).await;
    assert_eq!(status, StatusCode::OK, "body was {value}");
    let data = &value["data"];
    let job_ids = data["job_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    (data["submission_id"].as_str().unwrap().to_string(), job_ids)
}

#[tokio::test]
async fn test_info_is_wrapped_in_envelope() {
    let env = TestEnv::new();
    let (app, _satellite) = app(&env).await;

    let (status, value) = get(&app, "/info").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["name"], "test-satellite");
    assert!(value["timestamp"].is_string());
    assert!(value["version"].is_string());
    let data = &value["data"];
    assert_eq!(data["name"], "test-satellite");
    assert_eq!(data["queue_size"], env.config.scheduler.queue_size);
    assert_eq!(data["queued"], 0);
    assert_eq!(data["num_jobs"], 0);
    assert_eq!(data["advertise"], 0.0);
    assert!(data["uptime"].as_str().unwrap().starts_with("0:00:"));
}

#[tokio::test]
async fn test_available_tests_splits_valid_and_invalid() {
    let env = TestEnv::new();
    env.echo_script("good", 0);
    let broken = env.scripts_dir().join("broken");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("spec.json"), "{not json").unwrap();
    let (app, _satellite) = app(&env).await;

    let (status, value) = get(&app, "/available_tests").await;

    assert_eq!(status, StatusCode::OK);
    let valid = value["data"]["valid"].as_array().unwrap();
    let invalid = value["data"]["invalid"].as_array().unwrap();
    assert_eq!(valid.len(), 1);
    assert_eq!(valid[0]["name"], "good");
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0]["name"], "broken");
}

#[tokio::test]
async fn test_spec_resolves_dynamic_options() {
    let env = TestEnv::new();
    env.script(
        "gpu_test",
        json!({
            "description": "gpu",
            "parameters": [
                {"name": "gpu", "options": ["any"], "shell": "printf 'a100\\n\\nh100\\n'"}
            ]
        }),
        "exit 0",
    );
    let (app, _satellite) = app(&env).await;

    let (status, value) = get(&app, "/spec/gpu_test").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        value["data"]["parameters"][0]["options"],
        json!(["any", "a100", "h100"])
    );
    assert_eq!(value["data"]["parameters"][0]["name"], "gpu");

    let (status, value) = get(&app, "/spec/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(value["data"]["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_run_validates_body() {
    let env = TestEnv::new();
    let (app, _satellite) = app(&env).await;

    let (status, value) = post(&app, "/run", "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["data"]["error"].is_string());

    let (status, value) = post(&app, "/run", r#"{"note": "no jobs"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["data"]["echo"], json!({"note": "no jobs"}));
    assert!(value["data"]["error"].as_str().unwrap().contains("job_specs"));

    let (submission_id, job_ids) = run(
        &app,
        json!({"job_specs": [{"name": "a"}, {"name": "b", "params": {"x": 1}}]}),
    )
    .await;
    assert_eq!(submission_id.len(), 22);
    assert_eq!(job_ids.len(), 2);

    let (status, value) = get(&app, &format!("/submission/{submission_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["status"], "PENDING");
    assert_eq!(value["data"]["num_jobs"], 2);
}

#[tokio::test]
async fn test_run_rejects_when_queue_full() {
    let mut env = TestEnv::new();
    env.config.scheduler.queue_size = 1;
    let (app, _satellite) = app(&env).await;

    run(&app, json!({"job_specs": [{"name": "a"}]})).await;
    let (status, value) = post(&app, "/run", r#"{"job_specs": [{"name": "a"}]}"#).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["data"]["error"], "submission queue full - try again later.");
    let (_, jobs) = get(&app, "/jobs").await;
    assert_eq!(jobs["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_job_listings_filter_and_slice() {
    let env = TestEnv::new();
    let (app, _satellite) = app(&env).await;
    let (first, _) = run(&app, json!({"job_specs": [{"name": "a"}]})).await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let (second, _) = run(&app, json!({"job_specs": [{"name": "b"}, {"name": "c"}]})).await;

    let (_, value) = get(&app, "/jobs").await;
    assert_eq!(value["data"].as_array().unwrap().len(), 3);

    let (_, value) = get(&app, "/jobs/pending").await;
    assert_eq!(value["data"].as_array().unwrap().len(), 3);
    let (_, value) = get(&app, "/jobs/DONE").await;
    assert!(value["data"].as_array().unwrap().is_empty());
    let (status, value) = get(&app, "/jobs/bogus").await;
    assert_eq!(status, StatusCode::OK);
    assert!(value["data"].as_array().unwrap().is_empty());

    let (_, value) = get(&app, "/jobs/range/0/2").await;
    assert_eq!(value["data"]["total"], 3);
    assert_eq!(value["data"]["slice"].as_array().unwrap().len(), 2);
    let (status, _) = get(&app, "/jobs/range/x/2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, value) = get(&app, "/submissions").await;
    let subs = value["data"].as_array().unwrap();
    assert_eq!(subs.len(), 2);
    assert_eq!(subs[0]["submission_id"], second.as_str());
    assert_eq!(subs[1]["submission_id"], first.as_str());

    let (_, value) = get(&app, "/submissions/range/-1/10").await;
    assert_eq!(value["data"]["total"], 2);
    assert_eq!(value["data"]["slice"][0]["submission_id"], first.as_str());

    let (_, value) = get(&app, &format!("/submission_jobs/{second}")).await;
    let names: Vec<&str> = value["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["b", "c"]);
    let (status, _) = get(&app, "/submission_jobs/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_job_details_and_logs() {
    let env = TestEnv::new();
    let (app, _satellite) = app(&env).await;
    let (_, job_ids) = run(&app, json!({"job_specs": [{"name": "a"}]})).await;
    let job_id = &job_ids[0];

    let job_dir = env.logs_dir().join(job_id);
    std::fs::create_dir_all(&job_dir).unwrap();
    std::fs::write(job_dir.join("stdout.log"), "hello\n").unwrap();
    std::fs::write(job_dir.join("stderr.log"), "").unwrap();
    std::fs::write(
        job_dir.join("big.log"),
        vec![b'x'; MAX_INLINE_LOG as usize + 1],
    )
    .unwrap();

    let (status, value) = get(&app, &format!("/job/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["name"], "a");
    assert_eq!(
        value["data"]["logs"],
        json!(["big.log", "stderr.log", "stdout.log"])
    );

    let (status, value) = get(&app, "/job/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(value["data"]["error"].is_string());

    let (status, value) = get(&app, &format!("/job/{job_id}/log/stdout.log")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"], "hello\n");

    let (status, value) = get(&app, &format!("/job/{job_id}/log/big.log")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["data"]["error"], "File too large, see raw");

    let (status, _) = get(&app, &format!("/job/{job_id}/log/nope.log")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(&app, &format!("/job/{job_id}/log/..%2Fstate.redb")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/job/{job_id}/lograw/big.log"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        format!("filename=\"{job_id}.big.log\"").as_str()
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.len() as u64, MAX_INLINE_LOG + 1);
}

#[tokio::test]
async fn test_cancel_endpoints() {
    let env = TestEnv::new();
    let (app, _satellite) = app(&env).await;
    let (submission_id, job_ids) =
        run(&app, json!({"job_specs": [{"name": "a"}, {"name": "b"}]})).await;

    let (status, value) = post(&app, &format!("/cancel_job/{}", job_ids[0]), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"], json!({}));
    let (_, value) = get(&app, &format!("/job/{}", job_ids[0])).await;
    assert_eq!(value["data"]["status"], "CANCELED");

    let (status, _) = post(&app, &format!("/cancel_job/{}", job_ids[0]), "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = post(&app, "/cancel_job/unknown", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(&app, &format!("/cancel_submission/{submission_id}"), "").await;
    assert_eq!(status, StatusCode::OK);
    let (_, value) = get(&app, "/submissions/canceled").await;
    assert_eq!(value["data"].as_array().unwrap().len(), 1);
    let (_, value) = get(&app, &format!("/job/{}", job_ids[1])).await;
    assert_eq!(value["data"]["status"], "CANCELED");

    let (status, _) = post(&app, &format!("/cancel_submission/{submission_id}"), "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = post(&app, "/cancel_submission/unknown", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
