//! Integration tests for site application, TLS bootstrap and removal.

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;

use common::{Sandbox, ACTOR};
use owehost::model::{Runtime, Site};
use owehost::ErrorKind;

fn php_site() -> Site {
    let mut site = Site::new("acme.test", Runtime::Php("8.2".to_string()));
    site.document_root = "public".to_string();
    site
}

async fn sandbox_with_tenant() -> Sandbox {
    let sandbox = Sandbox::new();
    sandbox.create_tenant(10001, "acme").await;
    sandbox
}

#[tokio::test]
async fn php_site_writes_content_vhost_and_pool() {
    let sandbox = sandbox_with_tenant().await;
    let layout = sandbox.components.store.layout();

    let result = sandbox
        .components
        .applier
        .apply_site(10001, &php_site(), ACTOR, &sandbox.token)
        .await
        .unwrap();
    assert!(result.created);

    let index = sandbox.path("/srv/accounts/a-10001/web/acme.test/public/index.html");
    assert!(fs::read_to_string(index).unwrap().contains("acme.test"));

    let available = sandbox.path("/etc/nginx/sites-available/a-10001-acme.test.conf");
    let enabled = sandbox.path("/etc/nginx/sites-enabled/a-10001-acme.test.conf");
    assert_eq!(fs::read_link(&enabled).unwrap(), available);

    let socket = layout.php_socket("8.2", 10001);
    assert_eq!(socket, sandbox.path("/run/php/php8.2-fpm-a10001.sock"));

    let vhost = fs::read_to_string(&available).unwrap();
    assert!(vhost.contains("server_name acme.test www.acme.test"));
    assert!(vhost.contains(&format!("fastcgi_pass unix:{}", socket.display())));
    assert!(!vhost.contains("listen 443"));

    let pool = fs::read_to_string(sandbox.path("/etc/php/8.2/fpm/pool.d/a-10001-acme.test.conf")).unwrap();
    let tenant_dir = layout.tenant_dir(10001);
    assert!(pool.contains("user = a10001"));
    assert!(pool.contains(&format!("listen = {}", socket.display())));
    assert!(pool.contains(&format!("open_basedir] = {}:/tmp:/usr/share/php", tenant_dir.display())));

    let stored = sandbox.components.store.read_site(10001, "acme.test").unwrap();
    assert_eq!(stored, php_site());
}

#[tokio::test]
async fn ssl_redirect_bootstraps_a_self_signed_certificate() {
    let sandbox = sandbox_with_tenant().await;
    let mut site = php_site();
    site.ssl = true;
    site.ssl_redirect = true;

    let result = sandbox
        .components
        .applier
        .apply_site(10001, &site, ACTOR, &sandbox.token)
        .await
        .unwrap();
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert_eq!(sandbox.host.calls_to("openssl").len(), 1);

    let vhost = fs::read_to_string(sandbox.path("/etc/nginx/sites-available/a-10001-acme.test.conf")).unwrap();
    let (plain, secure) = vhost.split_at(vhost.find("listen 443").unwrap());
    assert!(plain.contains("return 301 https://$server_name$request_uri"));
    assert!(!plain.contains("try_files"));
    assert!(secure.contains("Strict-Transport-Security"));

    let ssl_dir = sandbox.path("/srv/accounts/a-10001/ssl/acme.test");
    let meta: serde_json::Value =
        serde_json::from_slice(&fs::read(ssl_dir.join("meta.json")).unwrap()).unwrap();
    assert_eq!(meta["type"], "self-signed");
    assert_eq!(meta["domain"], "acme.test");
    assert!(ssl_dir.join("fullchain.pem").is_file());
    let key_mode = fs::metadata(ssl_dir.join("key.pem")).unwrap().permissions().mode() & 0o777;
    assert_eq!(key_mode, 0o600);

    // An existing pair is reused
    sandbox
        .components
        .applier
        .apply_site(10001, &site, ACTOR, &sandbox.token)
        .await
        .unwrap();
    assert_eq!(sandbox.host.calls_to("openssl").len(), 1);
}

#[tokio::test]
async fn traversing_document_root_is_rejected_without_side_effects() {
    let sandbox = sandbox_with_tenant().await;
    let site_dir = sandbox.path("/srv/accounts/a-10001/web/acme.test");

    for root in ["../etc", "/etc", "public/../../etc"] {
        let mut site = Site::new("acme.test", Runtime::Static);
        site.document_root = root.to_string();
        let err = sandbox
            .components
            .applier
            .apply_site(10001, &site, ACTOR, &sandbox.token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{}", root);
        assert!(!site_dir.exists(), "{}", root);
    }

    // An existing site is left exactly as it was
    sandbox
        .components
        .applier
        .apply_site(10001, &php_site(), ACTOR, &sandbox.token)
        .await
        .unwrap();
    let before = fs::read(site_dir.join("site.json")).unwrap();
    let mut bad = php_site();
    bad.document_root = "../etc".to_string();
    assert!(sandbox
        .components
        .applier
        .apply_site(10001, &bad, ACTOR, &sandbox.token)
        .await
        .is_err());
    assert_eq!(fs::read(site_dir.join("site.json")).unwrap(), before);
}

#[tokio::test]
async fn site_on_missing_tenant_is_not_found() {
    let sandbox = Sandbox::new();
    let err = sandbox
        .components
        .applier
        .apply_site(10009, &php_site(), ACTOR, &sandbox.token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!sandbox.path("/srv/accounts/a-10009").exists());
}

#[tokio::test]
async fn switching_to_static_drops_the_pool() {
    let sandbox = sandbox_with_tenant().await;
    let applier = &sandbox.components.applier;
    applier.apply_site(10001, &php_site(), ACTOR, &sandbox.token).await.unwrap();

    let mut site = php_site();
    site.runtime = Runtime::Static;
    let result = applier.apply_site(10001, &site, ACTOR, &sandbox.token).await.unwrap();
    assert!(!result.created);

    assert!(!sandbox.path("/etc/php/8.2/fpm/pool.d/a-10001-acme.test.conf").exists());
    let vhost = fs::read_to_string(sandbox.path("/etc/nginx/sites-available/a-10001-acme.test.conf")).unwrap();
    assert!(!vhost.contains("fastcgi_pass"));
}

#[tokio::test]
async fn delete_site_removes_configs_and_material() {
    let sandbox = sandbox_with_tenant().await;
    let applier = &sandbox.components.applier;
    let mut site = php_site();
    site.ssl = true;
    applier.apply_site(10001, &site, ACTOR, &sandbox.token).await.unwrap();

    applier.delete_site(10001, "acme.test", ACTOR, &sandbox.token).await.unwrap();
    for path in [
        "/etc/nginx/sites-available/a-10001-acme.test.conf",
        "/etc/nginx/sites-enabled/a-10001-acme.test.conf",
        "/etc/php/8.2/fpm/pool.d/a-10001-acme.test.conf",
        "/srv/accounts/a-10001/web/acme.test",
        "/srv/accounts/a-10001/ssl/acme.test",
    ] {
        assert!(fs::symlink_metadata(sandbox.path(path)).is_err(), "{} survived", path);
    }
    assert!(sandbox.components.store.list_sites(10001).unwrap().is_empty());
}

#[tokio::test]
async fn failed_certificate_generation_keeps_the_node_loadable() {
    let sandbox = sandbox_with_tenant().await;
    sandbox.host.fail("openssl", 127);
    let mut site = php_site();
    site.ssl = true;
    site.ssl_redirect = true;

    let result = sandbox
        .components
        .applier
        .apply_site(10001, &site, ACTOR, &sandbox.token)
        .await
        .unwrap();
    assert_eq!(result.warnings.len(), 1, "{:?}", result.warnings);

    let vhost = fs::read_to_string(sandbox.path("/etc/nginx/sites-available/a-10001-acme.test.conf")).unwrap();
    assert!(!vhost.contains("listen 443"));
    assert!(!vhost.contains("return 301"));
    assert!(!sandbox.path("/srv/accounts/a-10001/ssl/acme.test/cert.pem").exists());

    let stored = sandbox.components.store.read_site(10001, "acme.test").unwrap();
    assert!(!stored.ssl);
    assert!(!stored.ssl_redirect);

    // Once openssl works again the same request turns TLS on
    sandbox.host.recover("openssl");
    sandbox
        .components
        .applier
        .apply_site(10001, &site, ACTOR, &sandbox.token)
        .await
        .unwrap();
    assert!(sandbox.components.store.read_site(10001, "acme.test").unwrap().ssl);
    let vhost = fs::read_to_string(sandbox.path("/etc/nginx/sites-available/a-10001-acme.test.conf")).unwrap();
    assert!(vhost.contains("listen 443"));
}
