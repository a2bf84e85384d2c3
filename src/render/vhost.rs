// src/render/vhost.rs

use serde::Serialize;

use crate::error::Result;
use crate::host::tls::{FULLCHAIN_FILE, KEY_FILE};
use crate::model::{Runtime, Site};
use crate::store::Layout;

/// nginx server blocks for one site
pub(super) const VHOST: &str = r#"# Managed by owehost: tenant {{tenant_id}}, site {{domain}}
server {
    listen 80;
    listen [::]:80;
    server_name {{server_names}};
{{#if ssl_redirect}}

    return 301 https://$server_name$request_uri;
{{else}}
{{> site_body}}
{{/if}}
}
{{#if ssl}}

server {
    listen 443 ssl http2;
    listen [::]:443 ssl http2;
    server_name {{server_names}};

    ssl_certificate {{ssl_certificate}};
    ssl_certificate_key {{ssl_certificate_key}};
    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_prefer_server_ciphers on;
    ssl_session_cache shared:SSL:10m;
    ssl_session_timeout 10m;

    add_header Strict-Transport-Security "max-age=31536000; includeSubDomains" always;
{{> site_body}}
}
{{/if}}
"#;

/// Everything a server block serves, shared by the :80 and :443 blocks
pub(super) const SITE_BODY: &str = r#"
    root {{root}};
    index index.php index.html index.htm;

    access_log {{access_log}};
    error_log {{error_log}};

    add_header X-Frame-Options "SAMEORIGIN" always;
    add_header X-Content-Type-Options "nosniff" always;
    add_header X-XSS-Protection "1; mode=block" always;
{{#each headers}}
    add_header {{name}} "{{value}}" always;
{{/each}}
{{#each error_pages}}
    error_page {{code}} {{page}};
{{/each}}
{{#each redirects}}

    location {{matcher}} {{source}} {
        return {{code}} {{target}};
    }
{{/each}}
{{#if proxy}}

    location / {
        proxy_pass http://127.0.0.1:{{proxy_port}};
        proxy_http_version 1.1;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
    }
{{else}}

    location / {
        try_files $uri $uri/ /index.php?$query_string;
    }
{{/if}}
{{#if php}}

    location ~ \.php$ {
        try_files $uri =404;
        fastcgi_split_path_info ^(.+\.php)(/.+)$;
        fastcgi_pass unix:{{php_socket}};
        fastcgi_index index.php;
        include fastcgi_params;
        fastcgi_param SCRIPT_FILENAME $realpath_root$fastcgi_script_name;
        fastcgi_param DOCUMENT_ROOT $realpath_root;
    }
{{/if}}

    location ~ /\. {
        deny all;
    }

    location ~* \.(env|json|lock|md)$ {
        deny all;
    }

    location ~* \.(jpg|jpeg|png|gif|ico|svg|webp|css|js|woff|woff2|ttf|eot)$ {
        expires 30d;
        add_header Cache-Control "public, immutable";
    }
"#;

#[derive(Debug, Clone, Serialize)]
struct HeaderLine {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorPageLine {
    code: u16,
    page: String,
}

/// A redirect as an nginx `location` matcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectRule {
    /// `=`, `^~` or `~`
    pub matcher: String,
    pub source: String,
    pub target: String,
    pub code: u16,
}

/// Data bundle for the vhost template
#[derive(Debug, Clone, Serialize)]
pub struct VhostData {
    tenant_id: u32,
    domain: String,
    server_names: String,
    root: String,
    access_log: String,
    error_log: String,
    ssl: bool,
    ssl_redirect: bool,
    ssl_certificate: String,
    ssl_certificate_key: String,
    php: bool,
    php_socket: String,
    proxy: bool,
    proxy_port: u16,
    headers: Vec<HeaderLine>,
    error_pages: Vec<ErrorPageLine>,
    redirects: Vec<RedirectRule>,
}

impl VhostData {
    pub fn new(layout: &Layout, tenant_id: u32, site: &Site) -> Result<Self> {
        let root = layout.document_root(tenant_id, &site.domain, &site.document_root)?;
        let site_dir = layout.site_dir(tenant_id, &site.domain);
        let ssl_dir = layout.ssl_dir(tenant_id, &site.domain);

        let mut server_names = vec![site.domain.clone(), format!("www.{}", site.domain)];
        for alias in &site.aliases {
            if !server_names.contains(alias) {
                server_names.push(alias.clone());
            }
        }

        let php_socket = site
            .runtime
            .php_version()
            .map(|version| layout.php_socket(version, tenant_id).display().to_string())
            .unwrap_or_default();

        let proxy_port = match &site.runtime {
            Runtime::NodeJs(_) => Some(site.node_settings().port),
            Runtime::Python(_) => Some(site.python_settings().port),
            _ => None,
        };

        Ok(Self {
            tenant_id,
            domain: site.domain.clone(),
            server_names: server_names.join(" "),
            root: root.display().to_string(),
            access_log: site_dir.join("logs").join("access.log").display().to_string(),
            error_log: site_dir.join("logs").join("error.log").display().to_string(),
            ssl: site.ssl,
            ssl_redirect: site.ssl && site.ssl_redirect,
            ssl_certificate: ssl_dir.join(FULLCHAIN_FILE).display().to_string(),
            ssl_certificate_key: ssl_dir.join(KEY_FILE).display().to_string(),
            php: site.runtime.is_php(),
            php_socket,
            proxy: proxy_port.is_some(),
            proxy_port: proxy_port.unwrap_or_default(),
            headers: site
                .headers
                .iter()
                .map(|(name, value)| HeaderLine {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            error_pages: site
                .error_pages
                .iter()
                .map(|(code, page)| ErrorPageLine {
                    code: *code,
                    page: page.clone(),
                })
                .collect(),
            redirects: site.redirects.iter().map(redirect_rule).collect(),
        })
    }
}

fn redirect_rule(redirect: &crate::model::Redirect) -> RedirectRule {
    let (matcher, source) = if redirect.regex {
        ("~", redirect.source.clone())
    } else if redirect.wildcard {
        ("^~", redirect.source.trim_end_matches('*').to_string())
    } else {
        ("=", redirect.source.clone())
    };
    RedirectRule {
        matcher: matcher.to_string(),
        source,
        target: redirect.target.clone(),
        code: redirect.code,
    }
}
