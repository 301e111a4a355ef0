//! Lifecycle tests: init, install, uninstall, update checks and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use plugd_plugin::{
    BackendClient, BackendFactory, InstallOptions, PluginClass, PluginError, PluginResult,
    PluginSource, PluginType,
};

use crate::helpers::{CountingClient, PluginSpec, TestEnv};

#[tokio::test]
async fn test_init_creates_plugins_dir_and_loads_in_order() {
    let env = TestEnv::new();
    let plugins_path = env.config.plugins_path.clone();
    let bundled = env.config.bundled_plugins_path.clone().unwrap();

    env.add_core(PluginSpec::frontend("graph", PluginType::Panel));
    env.loader
        .add(&bundled, PluginSpec::frontend("bundled-ds", PluginType::Datasource));
    env.loader
        .add(&plugins_path, PluginSpec::frontend("acme-panel", PluginType::Panel));
    assert!(!plugins_path.exists());

    env.manager.init().await.unwrap();

    assert!(plugins_path.is_dir());

    let calls = env.loader.load_calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![env.config.core_plugin_dirs(), vec![bundled], vec![plugins_path]]
    );

    let graph = env.manager.plugin("graph").await.unwrap();
    assert_eq!(graph.class, PluginClass::Core);
    let bundled_ds = env.manager.plugin("bundled-ds").await.unwrap();
    assert_eq!(bundled_ds.class, PluginClass::Bundled);
    let acme = env.manager.plugin("acme-panel").await.unwrap();
    assert_eq!(acme.class, PluginClass::External);
}

#[tokio::test]
async fn test_core_plugin_shadows_external_with_same_id() {
    let env = TestEnv::new();
    env.add_core(PluginSpec::frontend("graph", PluginType::Panel));
    env.add_external(PluginSpec::frontend("graph", PluginType::Panel).version("9.9.9"));

    env.manager.init().await.unwrap();

    let graph = env.manager.plugin("graph").await.unwrap();
    assert_eq!(graph.class, PluginClass::Core);
    assert_eq!(env.manager.registry().count().await, 1);
}

#[tokio::test]
async fn test_init_starts_backend_plugins() {
    let env = TestEnv::new();
    let client = Arc::new(CountingClient::default());
    env.add_external(PluginSpec::backend("acme-datasource", client.clone()));

    env.manager.init().await.unwrap();

    assert_eq!(client.starts(), 1);
    assert_eq!(env.manager.supervisor().watchdog_count(), 1);

    env.manager.shutdown().await;
}

#[tokio::test]
async fn test_install_same_version_is_duplicate() {
    let env = TestEnv::new();
    let dir = env.add_external(PluginSpec::frontend("acme", PluginType::Panel));
    std::fs::write(dir.join("plugin.json"), "{}").unwrap();
    env.manager.init().await.unwrap();

    let err = env
        .manager
        .install("acme", "1.0.0", InstallOptions::default())
        .await
        .unwrap_err();

    match err {
        PluginError::DuplicatePlugin {
            plugin_id,
            existing_dir,
        } => {
            assert_eq!(plugin_id, "acme");
            assert_eq!(existing_dir, dir);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(env.installer.calls().is_empty());
    assert!(dir.join("plugin.json").exists());
    assert!(env.manager.plugin("acme").await.is_some());
}

#[tokio::test]
async fn test_install_new_version_replaces_existing() {
    let env = TestEnv::new();
    let dir = env.add_external(PluginSpec::frontend("acme", PluginType::Datasource));
    std::fs::write(dir.join("old.txt"), "v1").unwrap();
    env.manager.init().await.unwrap();
    let old = env.manager.plugin("acme").await.unwrap();

    env.manager
        .install("acme", "2.0.0", InstallOptions::default())
        .await
        .unwrap();

    assert_eq!(
        env.installer.calls(),
        vec![
            "update-info acme@2.0.0".to_string(),
            format!("uninstall {}", dir.display()),
            "install acme@2.0.0 zip=https://repo.example/acme-2.0.0.zip".to_string(),
        ]
    );

    assert!(old.is_decommissioned());
    let new = env.manager.plugin("acme").await.unwrap();
    assert_eq!(new.version, "2.0.0");
    assert!(!new.is_decommissioned());
    assert!(dir.is_dir());
    assert!(!dir.join("old.txt").exists());
}

#[tokio::test]
async fn test_install_fresh_plugin_with_explicit_options() {
    let env = TestEnv::new();
    env.manager.init().await.unwrap();

    let custom_dir = env.root.path().join("custom");
    std::fs::create_dir_all(&custom_dir).unwrap();

    env.manager
        .install(
            "acme",
            "1.2.0",
            InstallOptions {
                repo_url: Some("https://mirror.example".into()),
                install_dir: Some(custom_dir.clone()),
                zip_url: Some("https://mirror.example/acme.zip".into()),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        env.installer.calls(),
        vec!["install acme@1.2.0 zip=https://mirror.example/acme.zip".to_string()]
    );
    let plugin = env.manager.plugin("acme").await.unwrap();
    assert_eq!(plugin.version, "1.2.0");
    assert_eq!(plugin.plugin_dir, custom_dir.join("acme"));
}

#[tokio::test]
async fn test_core_plugins_cannot_be_installed_or_uninstalled() {
    let env = TestEnv::new();
    env.add_core(PluginSpec::frontend("graph", PluginType::Panel));
    env.manager.init().await.unwrap();

    let err = env
        .manager
        .install("graph", "2.0.0", InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::CannotInstallCore { .. }));

    let err = env.manager.uninstall("graph").await.unwrap_err();
    assert!(matches!(err, PluginError::CannotUninstallCore { .. }));

    assert!(env.installer.calls().is_empty());
    assert!(env.manager.plugin("graph").await.is_some());
}

#[tokio::test]
async fn test_uninstall_unknown_plugin() {
    let env = TestEnv::new();
    env.manager.init().await.unwrap();

    let err = env.manager.uninstall("missing").await.unwrap_err();
    assert!(matches!(err, PluginError::NotInstalled { plugin_id } if plugin_id == "missing"));
}

#[tokio::test]
async fn test_uninstall_stops_unregisters_and_removes() {
    let env = TestEnv::new();
    let client = Arc::new(CountingClient::default());
    let dir = env.add_external(PluginSpec::backend("acme-datasource", client.clone()));
    env.manager.init().await.unwrap();
    let plugin = env.manager.plugin("acme-datasource").await.unwrap();

    env.manager.uninstall("acme-datasource").await.unwrap();

    assert!(plugin.is_decommissioned());
    assert_eq!(client.stops(), 1);
    assert!(env.manager.plugin("acme-datasource").await.is_none());
    assert!(!dir.exists());
    assert!(env.config.plugins_path.is_dir());

    env.manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_uninstall_refuses_symlink_outside_plugins_dir() {
    let env = TestEnv::new();
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("precious.txt"), "keep me").unwrap();

    std::fs::create_dir_all(&env.config.plugins_path).unwrap();
    std::os::unix::fs::symlink(outside.path(), env.config.plugins_path.join("evil")).unwrap();
    env.loader.add(
        &env.config.plugins_path,
        PluginSpec::frontend("evil", PluginType::Panel),
    );
    env.manager.init().await.unwrap();

    let err = env.manager.uninstall("evil").await.unwrap_err();

    assert!(matches!(err, PluginError::UnsafeUninstallPath { .. }));
    assert!(outside.path().join("precious.txt").exists());
    assert!(env.installer.calls().is_empty());
    let plugin = env.manager.plugin("evil").await.unwrap();
    assert!(!plugin.is_decommissioned());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_of_disjoint_roots() {
    let env = TestEnv::new();
    let roots: Vec<_> = (0..4)
        .map(|r| env.root.path().join(format!("root-{r}")))
        .collect();
    for (r, root) in roots.iter().enumerate() {
        for i in 0..25 {
            env.loader.add(
                root,
                PluginSpec::frontend(&format!("plugin-{r}-{i}"), PluginType::Panel),
            );
        }
    }

    let source = |i: usize| [PluginSource::new(PluginClass::External, &roots[i])];
    let (a, b, c, d) = (source(0), source(1), source(2), source(3));
    let (ra, rb, rc, rd) = tokio::join!(
        env.manager.load(&a),
        env.manager.load(&b),
        env.manager.load(&c),
        env.manager.load(&d),
    );
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();
    rd.unwrap();

    assert_eq!(env.manager.registry().count().await, 100);
    assert_eq!(env.manager.registry().registered_ids().await.len(), 100);
}

#[tokio::test]
async fn test_load_and_register_core_backend() {
    let env = TestEnv::new();
    let client = Arc::new(CountingClient::default());
    let factory_client = client.clone();
    let factory: BackendFactory = Arc::new(
        move |_id: &str| -> PluginResult<Arc<dyn BackendClient>> { Ok(factory_client.clone()) },
    );

    env.manager
        .load_and_register("testdata", factory.clone())
        .await
        .unwrap();

    let plugin = env.manager.plugin("testdata").await.unwrap();
    assert_eq!(plugin.class, PluginClass::Core);
    assert!(plugin.backend);
    assert_eq!(
        plugin.plugin_dir,
        env.config
            .static_root_path
            .join("app/plugins/datasource/testdata")
    );
    assert_eq!(client.starts(), 0);

    let err = env
        .manager
        .load_and_register("testdata", factory)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::AlreadyRegistered { .. }));
}

#[tokio::test]
async fn test_check_for_updates_records_external_only() {
    let env = TestEnv::new();
    env.add_core(PluginSpec::frontend("graph", PluginType::Panel));
    env.add_external(PluginSpec::frontend("acme", PluginType::Panel));
    env.add_external(PluginSpec::frontend("beta", PluginType::Panel));
    {
        let mut latest = env.installer.latest.lock().unwrap();
        latest.insert("acme".into(), "1.1.0".into());
        latest.insert("beta".into(), "1.0.0".into());
        latest.insert("graph".into(), "9.0.0".into());
    }
    env.manager.init().await.unwrap();

    env.manager.check_for_updates().await;

    assert_eq!(
        env.manager.available_update("acme").await.as_deref(),
        Some("1.1.0")
    );
    assert_eq!(env.manager.available_update("beta").await, None);
    assert_eq!(env.manager.available_update("graph").await, None);
}

#[tokio::test]
async fn test_renderer_and_routes() {
    let env = TestEnv::new();
    env.add_external(PluginSpec::frontend("acme-renderer", PluginType::Renderer));
    env.add_external(PluginSpec::frontend("acme-panel", PluginType::Panel));
    env.manager.init().await.unwrap();

    let renderer = env.manager.renderer().await.unwrap();
    assert_eq!(renderer.id, "acme-renderer");
    assert!(renderer.is_renderer());

    let mut routes = env.manager.routes().await;
    routes.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
    assert_eq!(routes.len(), 2);
    assert_eq!(routes[0].plugin_id, "acme-panel");
    assert_eq!(
        routes[0].directory,
        env.config.plugins_path.join("acme-panel")
    );

    let panels = env.manager.plugins(&[PluginType::Panel]).await;
    assert_eq!(panels.len(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_every_backend() {
    let env = TestEnv::new();
    let first = Arc::new(CountingClient::default());
    let second = Arc::new(CountingClient::default());
    env.add_external(PluginSpec::backend("first", first.clone()));
    env.add_external(PluginSpec::backend("second", second.clone()));
    env.manager.init().await.unwrap();
    assert_eq!(env.manager.supervisor().watchdog_count(), 2);

    env.manager.shutdown().await;

    assert_eq!(first.stops(), 1);
    assert_eq!(second.stops(), 1);
    assert_eq!(env.manager.supervisor().watchdog_count(), 0);
}

#[tokio::test]
async fn test_run_checks_updates_until_cancelled() {
    let env = TestEnv::new();
    let client = Arc::new(CountingClient::default());
    env.add_external(PluginSpec::backend("acme", client.clone()));
    env.installer
        .latest
        .lock()
        .unwrap()
        .insert("acme".into(), "2.0.0".into());
    env.manager.init().await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::join!(env.manager.run(cancel), async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    assert_eq!(
        env.manager.available_update("acme").await.as_deref(),
        Some("2.0.0")
    );
    assert_eq!(client.stops(), 1);
}

#[tokio::test]
async fn test_renderer_is_first_registered() {
    let env = TestEnv::new();
    env.add_external(PluginSpec::frontend("zz-renderer", PluginType::Renderer));
    env.add_external(PluginSpec::frontend("aa-renderer", PluginType::Renderer));
    env.add_external(PluginSpec::frontend("mm-renderer", PluginType::Renderer));
    env.manager.init().await.unwrap();

    for _ in 0..10 {
        let renderer = env.manager.renderer().await.unwrap();
        assert_eq!(renderer.id, "zz-renderer");
    }
}

#[tokio::test]
async fn test_run_with_zero_update_interval() {
    let env = TestEnv::with_config(|config| {
        config.update_checks_enabled = true;
        config.update_check_interval_seconds = 0;
    });
    let client = Arc::new(CountingClient::default());
    env.add_external(PluginSpec::backend("acme", client.clone()));
    env.manager.init().await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::join!(env.manager.run(cancel), async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    assert_eq!(client.stops(), 1);
}
