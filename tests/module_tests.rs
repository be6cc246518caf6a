//! Builtin modules driven through the module runner

use cloud_init_engine::config::Config;
use cloud_init_engine::datasources::MetadataBundle;
use cloud_init_engine::modules::{ModuleRegistry, ModuleRunner};
use cloud_init_engine::ssh::authorized_keys::{AuthKeyLine, parse_authorized_keys, update_authorized_keys};
use cloud_init_engine::ssh::{SshPaths, setup_user_keys};
use cloud_init_engine::state::{CloudPaths, Frequency, FrequencyLedger};
use cloud_init_engine::Cloud;
use std::fs;
use tempfile::TempDir;

struct Fixture {
    temp: TempDir,
    cloud: Cloud,
    ledger: FrequencyLedger,
}

fn fixture(instance_id: &str) -> Fixture {
    let temp = TempDir::new().unwrap();
    let paths = CloudPaths::with_dirs(temp.path().join("var"), temp.path().join("etc"));
    fs::create_dir_all(paths.scripts_dir(instance_id)).unwrap();
    let mut bundle = MetadataBundle::new();
    bundle.set("local-hostname", "node7.example.net");
    let cloud = Cloud::new(paths.clone(), instance_id, "NoCloud", bundle);
    let ledger = FrequencyLedger::for_instance(&paths, instance_id);
    Fixture { temp, cloud, ledger }
}

#[tokio::test]
async fn test_write_files_then_runcmd_script() {
    let fx = fixture("i-modules");
    let target = fx.temp.path().join("etc-app/app.conf");
    let config = Config::from_yaml(&format!(
        r#"
write_files:
  - path: {target}
    content: |
      port: 8080
  - path: {target}
    content: "debug: true\n"
    append: true
    permissions: "0600"
runcmd:
  - echo first
  - [touch, "it's here"]
cloud_config_modules:
  - write-files
  - runcmd
"#,
        target = target.display()
    ))
    .unwrap();

    let registry = ModuleRegistry::builtin();
    let report = ModuleRunner::new(&registry, &fx.ledger, &fx.cloud, &config)
        .run_section("cloud_config_modules")
        .await;
    assert!(report.is_success(), "{:?}", report.failed_names());
    assert_eq!(report.ran, vec!["write-files", "runcmd"]);

    assert_eq!(fs::read_to_string(&target).unwrap(), "port: 8080\ndebug: true\n");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let script = fs::read_to_string(fx.cloud.paths().scripts_dir("i-modules").join("runcmd")).unwrap();
    assert_eq!(script, "#!/bin/sh\necho first\n'touch' 'it'\\''s here'\n");
}

#[tokio::test]
async fn test_bad_module_config_is_reported_and_later_modules_run() {
    let fx = fixture("i-bad");
    let config = Config::from_yaml(
        "write_files: not-a-list\nruncmd: [\"true\"]\ncloud_config_modules: [write_files, runcmd]\n",
    )
    .unwrap();

    let registry = ModuleRegistry::builtin();
    let report = ModuleRunner::new(&registry, &fx.ledger, &fx.cloud, &config)
        .run_section("cloud_config_modules")
        .await;
    assert_eq!(report.failed_names(), vec!["write_files"]);
    assert_eq!(report.ran, vec!["write_files", "runcmd"]);
    assert!(fx.cloud.paths().scripts_dir("i-bad").join("runcmd").exists());

    // the failure is recorded, so the module is not retried this instance
    assert!(fx.ledger.has_run("config-write_files", Frequency::PerInstance).await);
}

#[tokio::test]
async fn test_frequency_override_on_list_entry() {
    let fx = fixture("i-freq");
    let out = fx.temp.path().join("runcmd-count");
    let config = Config::from_yaml(&format!(
        "runcmd: [\"echo x >> {}\"]\ncloud_config_modules:\n  - [runcmd, always]\n",
        out.display()
    ))
    .unwrap();

    let registry = ModuleRegistry::builtin();
    let runner = ModuleRunner::new(&registry, &fx.ledger, &fx.cloud, &config);
    runner.run_section("cloud_config_modules").await;
    runner.run_section("cloud_config_modules").await;

    assert!(!fx.ledger.has_run("config-runcmd", Frequency::PerInstance).await);
    assert!(fx.cloud.paths().scripts_dir("i-freq").join("runcmd").exists());
}

#[tokio::test]
async fn test_hostname_written_from_metadata() {
    use cloud_init_engine::modules::hostname::SetHostnameModule;
    use std::sync::Arc;

    let fx = fixture("i-host");
    let hostname_file = fx.temp.path().join("hostname");
    let mut registry = ModuleRegistry::new();
    registry.register(Arc::new(SetHostnameModule {
        hostname_file: hostname_file.clone(),
        apply_live: false,
    }));

    let config = Config::from_yaml("cloud_init_modules: [set-hostname]\n").unwrap();
    let report = ModuleRunner::new(&registry, &fx.ledger, &fx.cloud, &config)
        .run_section("cloud_init_modules")
        .await;
    assert!(report.is_success());
    assert_eq!(fs::read_to_string(&hostname_file).unwrap().trim(), "node7");
}

#[test]
fn test_authorized_keys_merge_keeps_order_and_comments() {
    let existing = parse_authorized_keys(
        "# managed by hand\nssh-rsa AAAA old-laptop\nssh-ed25519 BBBB build\n",
    );
    let new_keys = vec![
        AuthKeyLine::parse("ssh-ed25519 BBBB build-renamed", None),
        AuthKeyLine::parse("ssh-rsa CCCC new-desk", Some("no-pty")),
    ];

    let merged = update_authorized_keys(existing, &new_keys);
    assert_eq!(
        merged,
        "# managed by hand\nssh-rsa AAAA old-laptop\nssh-ed25519 BBBB build-renamed\nno-pty ssh-rsa CCCC new-desk\n"
    );

    let again = update_authorized_keys(parse_authorized_keys(&merged), &new_keys);
    assert_eq!(again, merged);
}

#[tokio::test]
async fn test_setup_user_keys_in_home_from_passwd() {
    let temp = TempDir::new().unwrap();
    let home = temp.path().join("home/deploy");
    fs::create_dir_all(&home).unwrap();
    let passwd = temp.path().join("passwd");
    fs::write(
        &passwd,
        format!("root:x:0:0:root:/root:/bin/sh\ndeploy:x:1000:1000::{}:/bin/sh\n", home.display()),
    )
    .unwrap();
    let paths = SshPaths {
        passwd,
        sshd_config: temp.path().join("missing_sshd_config"),
    };

    let written = setup_user_keys(&paths, "deploy", &["ssh-ed25519 KEY1 me".to_string()], None)
        .await
        .unwrap();
    assert_eq!(written, home.join(".ssh/authorized_keys"));
    assert_eq!(fs::read_to_string(&written).unwrap(), "ssh-ed25519 KEY1 me\n");
}
