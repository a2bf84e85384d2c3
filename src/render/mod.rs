// src/render/mod.rs

//! Service configuration rendering.
//!
//! Templates are registered once into a strict handlebars registry. Rendering
//! is pure: every function returns bytes and the caller decides where they go.

mod pool;
mod vhost;

use std::fmt;
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::model::Site;
use crate::store::Layout;

pub use pool::{PoolData, DISABLED_FUNCTIONS};
pub use vhost::{RedirectRule, VhostData};

const VHOST_TEMPLATE: &str = "vhost";
const SITE_BODY_PARTIAL: &str = "site_body";
const POOL_TEMPLATE: &str = "pool";
const MAIN_INCLUDE_TEMPLATE: &str = "main_include";

const MAIN_INCLUDE: &str = "include {{sites_enabled}}/*.conf;\n";

#[derive(Serialize)]
struct MainIncludeData {
    sites_enabled: String,
}

/// Renders nginx vhosts, PHP-FPM pools and the main nginx include
pub struct Renderer {
    registry: Handlebars<'static>,
    layout: Layout,
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer").field("layout", &self.layout).finish()
    }
}

impl Renderer {
    /// Builds the template registry
    pub fn new(layout: Layout) -> Result<Self> {
        let mut registry = Handlebars::new();
        // Strict mode fails the render when a template references a key the
        // data bundle does not provide
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);

        debug!("Building config template registry");
        for (name, template) in [
            (VHOST_TEMPLATE, vhost::VHOST),
            (POOL_TEMPLATE, pool::POOL),
            (MAIN_INCLUDE_TEMPLATE, MAIN_INCLUDE),
        ] {
            registry
                .register_template_string(name, template)
                .map_err(|e| render_error(name, e))?;
        }
        registry
            .register_partial(SITE_BODY_PARTIAL, vhost::SITE_BODY)
            .map_err(|e| render_error(SITE_BODY_PARTIAL, e))?;

        Ok(Self { registry, layout })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// nginx server blocks for a site
    pub fn render_vhost(&self, tenant_id: u32, site: &Site) -> Result<Vec<u8>> {
        let data = VhostData::new(&self.layout, tenant_id, site)?;
        self.render(VHOST_TEMPLATE, &data)
    }

    /// PHP-FPM pool for a PHP site
    pub fn render_pool(&self, tenant_id: u32, site: &Site) -> Result<Vec<u8>> {
        let data = PoolData::new(&self.layout, tenant_id, site)?;
        self.render(POOL_TEMPLATE, &data)
    }

    /// Include line pulling every enabled site into nginx
    pub fn render_main_include(&self) -> Result<Vec<u8>> {
        let data = MainIncludeData {
            sites_enabled: self.layout.sites_enabled_dir().display().to_string(),
        };
        self.render(MAIN_INCLUDE_TEMPLATE, &data)
    }

    fn render<T: Serialize>(&self, template: &str, data: &T) -> Result<Vec<u8>> {
        let rendered = self
            .registry
            .render(template, data)
            .map_err(|e| render_error(template, e))?;
        Ok(rendered.into_bytes())
    }
}

fn render_error(template: &str, err: impl fmt::Display) -> CoreError {
    CoreError::Render {
        template: template.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::error::ErrorKind;
    use crate::model::{NodeSettings, PhpSettings, Redirect, Runtime, RuntimeSettings};

    fn renderer() -> Renderer {
        Renderer::new(Layout::new(PathsConfig::default())).unwrap()
    }

    fn php_site() -> Site {
        let mut site = Site::new("acme.test", Runtime::Php("8.2".into()));
        site.document_root = "public".into();
        site
    }

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn php_vhost_without_ssl() {
        let conf = text(renderer().render_vhost(10001, &php_site()).unwrap());
        assert!(conf.contains("server_name acme.test www.acme.test;"));
        assert!(conf.contains("root /srv/accounts/a-10001/web/acme.test/public;"));
        assert!(conf.contains("fastcgi_pass unix:/run/php/php8.2-fpm-a10001.sock;"));
        assert!(conf.contains("try_files $uri $uri/ /index.php?$query_string;"));
        assert!(conf.contains(r#"add_header X-Frame-Options "SAMEORIGIN" always;"#));
        assert!(conf.contains(r#"add_header X-Content-Type-Options "nosniff" always;"#));
        assert!(conf.contains(r#"add_header X-XSS-Protection "1; mode=block" always;"#));
        assert!(conf.contains(r"location ~* \.(env|json|lock|md)$"));
        assert!(conf.contains("expires 30d;"));
        assert!(!conf.contains("listen 443"));
        assert!(!conf.contains("Strict-Transport-Security"));
    }

    #[test]
    fn ssl_redirect_replaces_the_plain_block() {
        let mut site = php_site();
        site.ssl = true;
        site.ssl_redirect = true;
        let conf = text(renderer().render_vhost(10001, &site).unwrap());

        let (plain, secure) = conf.split_at(conf.find("listen 443").unwrap());
        assert!(plain.contains("return 301 https://$server_name$request_uri;"));
        assert!(!plain.contains("try_files"));
        assert!(secure.contains("ssl_protocols TLSv1.2 TLSv1.3;"));
        assert!(secure.contains("ssl_certificate /srv/accounts/a-10001/ssl/acme.test/fullchain.pem;"));
        assert!(secure.contains("ssl_certificate_key /srv/accounts/a-10001/ssl/acme.test/key.pem;"));
        assert!(secure.contains(r#"Strict-Transport-Security "max-age=31536000; includeSubDomains""#));
        assert!(secure.contains("try_files $uri $uri/ /index.php?$query_string;"));
    }

    #[test]
    fn ssl_without_redirect_serves_both_ports() {
        let mut site = php_site();
        site.ssl = true;
        let conf = text(renderer().render_vhost(10001, &site).unwrap());
        assert_eq!(conf.matches("try_files $uri $uri/").count(), 2);
        assert!(!conf.contains("return 301 https://"));
    }

    #[test]
    fn aliases_headers_error_pages_and_redirects() {
        let mut site = Site::new("acme.test", Runtime::Static);
        site.aliases = vec!["acme.example".into()];
        site.headers.insert("X-Robots-Tag".into(), "noindex, nofollow".into());
        site.error_pages.insert(404, "/404.html".into());
        site.redirects = vec![
            Redirect {
                source: "/old".into(),
                target: "/new".into(),
                code: 301,
                regex: false,
                wildcard: false,
            },
            Redirect {
                source: "/blog/*".into(),
                target: "https://blog.acme.test/".into(),
                code: 302,
                regex: false,
                wildcard: true,
            },
            Redirect {
                source: "^/p/([0-9]+)$".into(),
                target: "/posts/$1".into(),
                code: 308,
                regex: true,
                wildcard: false,
            },
        ];
        let conf = text(renderer().render_vhost(10001, &site).unwrap());

        assert!(conf.contains("server_name acme.test www.acme.test acme.example;"));
        assert!(conf.contains(r#"add_header X-Robots-Tag "noindex, nofollow" always;"#));
        assert!(conf.contains("error_page 404 /404.html;"));
        assert!(conf.contains("location = /old {"));
        assert!(conf.contains("return 301 /new;"));
        assert!(conf.contains("location ^~ /blog/ {"));
        assert!(conf.contains("return 302 https://blog.acme.test/;"));
        assert!(conf.contains("location ~ ^/p/([0-9]+)$ {"));
        assert!(conf.contains("return 308 /posts/$1;"));
        assert!(!conf.contains("fastcgi_pass"));
    }

    #[test]
    fn node_sites_are_proxied() {
        let mut site = Site::new("app.test", Runtime::NodeJs(20));
        site.settings = Some(RuntimeSettings::Node(NodeSettings {
            port: 3100,
            ..NodeSettings::default()
        }));
        let conf = text(renderer().render_vhost(10002, &site).unwrap());
        assert!(conf.contains("proxy_pass http://127.0.0.1:3100;"));
        assert!(!conf.contains("try_files $uri $uri/"));
        assert!(!conf.contains("fastcgi_pass"));

        let python = Site::new("py.test", Runtime::Python("3.11".into()));
        let conf = text(renderer().render_vhost(10002, &python).unwrap());
        assert!(conf.contains("proxy_pass http://127.0.0.1:8000;"));
    }

    #[test]
    fn pool_defaults() {
        let conf = text(renderer().render_pool(10001, &php_site()).unwrap());
        assert!(conf.contains("[a10001-acme.test]"));
        assert!(conf.contains("user = a10001"));
        assert!(conf.contains("group = a10001"));
        assert!(conf.contains("listen = /run/php/php8.2-fpm-a10001.sock"));
        assert!(conf.contains("pm = dynamic"));
        assert!(conf.contains("pm.max_children = 10"));
        assert!(conf.contains("pm.start_servers = 2"));
        assert!(conf.contains("pm.min_spare_servers = 1"));
        assert!(conf.contains("pm.max_spare_servers = 4"));
        assert!(conf.contains("pm.max_requests = 500"));
        assert!(conf.contains("chdir = /srv/accounts/a-10001/web/acme.test"));
        assert!(conf.contains("php_admin_value[max_execution_time] = 300"));
        assert!(conf.contains("php_admin_value[memory_limit] = 256M"));
        assert!(conf.contains("php_admin_value[max_input_vars] = 5000"));
        assert!(conf.contains("php_admin_flag[display_errors] = Off"));
        assert!(conf.contains("open_basedir] = /srv/accounts/a-10001:/tmp:/usr/share/php"));
        assert!(conf.contains("disable_functions] = exec,passthru,shell_exec,system,proc_open,popen"));
        assert!(conf.contains("php_admin_value[error_log] = /srv/accounts/a-10001/web/acme.test/logs/php-error.log"));
    }

    #[test]
    fn pool_uses_site_settings() {
        let mut site = php_site();
        site.settings = Some(RuntimeSettings::Php(PhpSettings {
            memory_limit: "512M".into(),
            display_errors: true,
            ..PhpSettings::default()
        }));
        let conf = text(renderer().render_pool(10001, &site).unwrap());
        assert!(conf.contains("php_admin_value[memory_limit] = 512M"));
        assert!(conf.contains("php_admin_flag[display_errors] = On"));
    }

    #[test]
    fn pool_requires_php() {
        let err = renderer()
            .render_pool(10001, &Site::new("acme.test", Runtime::Static))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Render);
    }

    #[test]
    fn rendering_is_deterministic() {
        let r = renderer();
        let mut site = php_site();
        site.ssl = true;
        assert_eq!(r.render_vhost(10001, &site).unwrap(), r.render_vhost(10001, &site).unwrap());
    }

    #[test]
    fn main_include() {
        let conf = text(renderer().render_main_include().unwrap());
        assert_eq!(conf, "include /etc/nginx/sites-enabled/*.conf;\n");
    }
}
