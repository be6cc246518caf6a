//! EC2 boots against a wiremock metadata service

use cloud_init_engine::state::CloudPaths;
use cloud_init_engine::{CloudInitError, Pipeline, Stage, run_stages};
use std::fs;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_get(server: &MockServer, p: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(p))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn mount_instance(server: &MockServer, instance_id: &str) {
    Mock::given(method("PUT"))
        .and(path("/latest/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("session-token"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/latest/meta-data/instance-id"))
        .and(header("X-aws-ec2-metadata-token", "session-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string(instance_id))
        .mount(server)
        .await;
    mount_get(server, "/latest/meta-data/local-hostname", "ip-172-31-0-9.ec2.internal").await;
    mount_get(server, "/latest/meta-data/placement/availability-zone", "eu-west-2b").await;
}

fn pipeline_for(temp: &TempDir, server: &MockServer, extra: &str) -> (Pipeline, CloudPaths) {
    let paths = CloudPaths::with_dirs(temp.path().join("var"), temp.path().join("etc"));
    fs::create_dir_all(&paths.config).unwrap();
    let cfg = format!(
        "datasource_list: [Ec2]\ndatasource:\n  Ec2:\n    metadata_url: {}\n    timeout: 2\n{}",
        server.uri(),
        extra
    );
    fs::write(paths.main_config(), cfg).unwrap();
    (Pipeline::new(paths.clone()), paths)
}

#[tokio::test]
async fn test_boot_with_included_cloud_config() {
    let server = MockServer::start().await;
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("from-include");

    mount_instance(&server, "i-0abc123").await;
    mount_get(
        &server,
        "/configs/base.yaml",
        &format!(
            "#cloud-config\nwrite_files:\n  - path: {}\n    content: included\n",
            marker.display()
        ),
    )
    .await;
    mount_get(
        &server,
        "/latest/user-data",
        &format!("#include\n{}/configs/base.yaml\n", server.uri()),
    )
    .await;

    let (pipeline, paths) = pipeline_for(&temp, &server, "cloud_init_modules: [write_files]\n");
    run_stages(&pipeline, &[Stage::Local, Stage::Network]).await.unwrap();

    assert_eq!(fs::read_to_string(&marker).unwrap(), "included");
    let cloud_config = fs::read_to_string(paths.cloud_config("i-0abc123")).unwrap();
    assert!(cloud_config.contains("write_files"));

    assert_eq!(
        pipeline.query("region").await.unwrap(),
        Some(serde_json::json!("eu-west-2"))
    );
    assert_eq!(
        pipeline.query("datasource").await.unwrap(),
        Some(serde_json::json!("Ec2"))
    );
    assert_eq!(
        pipeline.query("hostname").await.unwrap(),
        Some(serde_json::json!("ip-172-31-0-9"))
    );
}

#[tokio::test]
async fn test_local_stage_skips_network_provider() {
    let server = MockServer::start().await;
    let temp = TempDir::new().unwrap();
    mount_instance(&server, "i-local").await;

    let (pipeline, _) = pipeline_for(&temp, &server, "");
    match pipeline.init(true).await {
        Err(CloudInitError::NoDatasource { searched }) => assert!(searched.is_empty()),
        other => panic!("expected no datasource, got {:?}", other.map(|r| r.datasource)),
    }

    let report = pipeline.init(false).await.unwrap();
    assert_eq!(report.datasource, "Ec2");
    assert_eq!(report.instance_id, "i-local");
    assert!(report.is_new_instance);
}

#[tokio::test]
async fn test_public_keys_reach_query() {
    let server = MockServer::start().await;
    let temp = TempDir::new().unwrap();
    mount_instance(&server, "i-keys").await;
    mount_get(&server, "/latest/meta-data/public-keys/", "0=deploy\n1=backup").await;
    mount_get(&server, "/latest/meta-data/public-keys/0/openssh-key", "ssh-ed25519 AAAA deploy").await;
    mount_get(&server, "/latest/meta-data/public-keys/1/openssh-key", "ssh-rsa BBBB backup\n").await;

    let (pipeline, _) = pipeline_for(&temp, &server, "");
    pipeline.init(false).await.unwrap();

    let keys = pipeline.query("public-keys").await.unwrap().unwrap();
    let keys: Vec<String> = serde_json::from_value(keys).unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&"ssh-ed25519 AAAA deploy".to_string()));
    assert!(keys.contains(&"ssh-rsa BBBB backup".to_string()));
}

#[tokio::test]
async fn test_metadata_service_without_instance_is_no_datasource() {
    let server = MockServer::start().await;
    let temp = TempDir::new().unwrap();

    let (pipeline, _) = pipeline_for(&temp, &server, "");
    let err = pipeline.init(false).await.unwrap_err();
    match err {
        CloudInitError::NoDatasource { searched } => assert_eq!(searched, vec!["Ec2"]),
        other => panic!("unexpected error: {other}"),
    }
}
