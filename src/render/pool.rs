// src/render/pool.rs

use serde::Serialize;

use crate::error::{CoreError, Result};
use crate::model::Site;
use crate::store::Layout;

/// Functions no tenant pool may call
pub const DISABLED_FUNCTIONS: &str = "exec,passthru,shell_exec,system,proc_open,popen";

/// Paths outside the tenant tree every pool may read
const SHARED_BASEDIRS: &[&str] = &["/tmp", "/usr/share/php"];

/// Owner of the FastCGI socket
const SOCKET_OWNER: &str = "www-data";

pub(super) const POOL: &str = r#"; Managed by owehost: tenant {{tenant_id}}, site {{domain}}
[{{pool_name}}]
user = {{user}}
group = {{user}}

listen = {{socket}}
listen.owner = {{socket_owner}}
listen.group = {{socket_owner}}
listen.mode = 0660

pm = dynamic
pm.max_children = 10
pm.start_servers = 2
pm.min_spare_servers = 1
pm.max_spare_servers = 4
pm.max_requests = 500

chdir = {{site_dir}}

php_admin_value[max_execution_time] = {{max_execution_time}}
php_admin_value[memory_limit] = {{memory_limit}}
php_admin_value[post_max_size] = {{post_max_size}}
php_admin_value[upload_max_filesize] = {{upload_max_filesize}}
php_admin_value[max_input_vars] = {{max_input_vars}}
php_admin_flag[display_errors] = {{display_errors}}
php_admin_value[open_basedir] = {{open_basedir}}
php_admin_value[disable_functions] = {{disable_functions}}
php_admin_value[error_log] = {{error_log}}
php_admin_flag[log_errors] = On
"#;

/// Data bundle for the pool template
#[derive(Debug, Clone, Serialize)]
pub struct PoolData {
    tenant_id: u32,
    domain: String,
    pool_name: String,
    user: String,
    socket: String,
    socket_owner: &'static str,
    site_dir: String,
    max_execution_time: u32,
    memory_limit: String,
    post_max_size: String,
    upload_max_filesize: String,
    max_input_vars: u32,
    display_errors: &'static str,
    open_basedir: String,
    disable_functions: &'static str,
    error_log: String,
}

impl PoolData {
    pub fn new(layout: &Layout, tenant_id: u32, site: &Site) -> Result<Self> {
        let version = site.runtime.php_version().ok_or_else(|| CoreError::Render {
            template: "pool".to_string(),
            message: format!("{} runs {}, not PHP", site.domain, site.runtime),
        })?;
        let settings = site.php_settings();
        let site_dir = layout.site_dir(tenant_id, &site.domain);
        let user = format!("a{}", tenant_id);

        let mut basedirs = vec![layout.tenant_dir(tenant_id).display().to_string()];
        basedirs.extend(SHARED_BASEDIRS.iter().map(|dir| dir.to_string()));

        Ok(Self {
            tenant_id,
            domain: site.domain.clone(),
            pool_name: format!("{}-{}", user, site.domain),
            socket: layout.php_socket(version, tenant_id).display().to_string(),
            socket_owner: SOCKET_OWNER,
            user,
            error_log: site_dir.join("logs").join("php-error.log").display().to_string(),
            site_dir: site_dir.display().to_string(),
            max_execution_time: settings.max_execution_time,
            memory_limit: settings.memory_limit,
            post_max_size: settings.post_max_size,
            upload_max_filesize: settings.upload_max_filesize,
            max_input_vars: settings.max_input_vars,
            display_errors: if settings.display_errors { "On" } else { "Off" },
            open_basedir: basedirs.join(":"),
            disable_functions: DISABLED_FUNCTIONS,
        })
    }
}
