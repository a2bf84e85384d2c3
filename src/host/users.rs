// src/host/users.rs

use std::path::Path;
use tracing::{debug, info};

use crate::error::Result;
use crate::host::{run_checked, HostOps};
use crate::model::Identity;

/// useradd/groupadd: name already in use
const EXIT_EXISTS: i32 = 9;

/// userdel/groupdel: name does not exist
const EXIT_MISSING: i32 = 6;

/// Whether a POSIX account resolves for `uid`
pub async fn user_exists(host: &dyn HostOps, uid: u32) -> Result<bool> {
    let output = host.run("id", vec![uid.to_string()]).await?;
    Ok(output.success())
}

/// Creates the tenant's group and user unless the uid already resolves.
/// Returns whether anything was created.
pub async fn ensure_user(host: &dyn HostOps, identity: &Identity, home: &Path) -> Result<bool> {
    if user_exists(host, identity.uid).await? {
        debug!(tenant_id = identity.id, "POSIX user {} already present", identity.uid);
        return Ok(false);
    }

    let gid = identity.gid.to_string();
    let uid = identity.uid.to_string();
    let home = home.to_string_lossy().into_owned();

    run_checked(host, "groupadd", &["--gid", &gid, &identity.name], &[EXIT_EXISTS]).await?;
    run_checked(
        host,
        "useradd",
        &[
            "--uid",
            &uid,
            "--gid",
            &gid,
            "--home-dir",
            &home,
            "--shell",
            "/bin/bash",
            "--no-create-home",
            &identity.name,
        ],
        &[EXIT_EXISTS],
    )
    .await?;

    info!(tenant_id = identity.id, "Created POSIX user {} ({})", identity.name, identity.uid);
    Ok(true)
}

/// Login name currently holding `uid`, if any
pub async fn user_name(host: &dyn HostOps, uid: u32) -> Result<Option<String>> {
    let output = host.run("id", vec!["-nu".to_string(), uid.to_string()]).await?;
    if !output.success() {
        return Ok(None);
    }
    let name = output.stdout.trim();
    Ok((!name.is_empty()).then(|| name.to_string()))
}

/// Removes the tenant's user and group; absence is not an error
pub async fn remove_user(host: &dyn HostOps, name: &str) -> Result<()> {
    run_checked(host, "userdel", &[name], &[EXIT_MISSING]).await?;
    run_checked(host, "groupdel", &[name], &[EXIT_MISSING]).await?;
    info!("Removed POSIX user and group {}", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::{CommandOutput, MockHostOps};
    use crate::model::Plan;
    use mockall::Sequence;

    fn exit(code: i32) -> CommandOutput {
        CommandOutput {
            code: Some(code),
            ..CommandOutput::default()
        }
    }

    #[tokio::test]
    async fn existing_uid_skips_creation() {
        let mut host = MockHostOps::new();
        host.expect_run()
            .withf(|program, args| program == "id" && args[..] == ["20001"])
            .times(1)
            .returning(|_, _| Ok(exit(0)));

        let identity = Identity::new(10001, "acme", "admin", Plan::Starter);
        assert!(!ensure_user(&host, &identity, Path::new("/srv/accounts/a-10001/home"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn creates_group_then_user_tolerating_exists() {
        let mut seq = Sequence::new();
        let mut host = MockHostOps::new();
        host.expect_run()
            .withf(|program, _| program == "id")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(exit(1)));
        host.expect_run()
            .withf(|program, args| program == "groupadd" && args[..2] == ["--gid", "20001"])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(exit(9)));
        host.expect_run()
            .withf(|program, args| {
                program == "useradd"
                    && args.contains(&"--no-create-home".to_string())
                    && args.last().map(String::as_str) == Some("acme")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(exit(0)));

        let identity = Identity::new(10001, "acme", "admin", Plan::Starter);
        assert!(ensure_user(&host, &identity, Path::new("/home")).await.unwrap());
    }

    #[tokio::test]
    async fn useradd_failure_is_fatal() {
        let mut host = MockHostOps::new();
        host.expect_run().returning(|program, _| {
            Ok(match program {
                "id" => exit(1),
                "useradd" => exit(4),
                _ => exit(0),
            })
        });
        let identity = Identity::new(10001, "acme", "admin", Plan::Starter);
        let err = ensure_user(&host, &identity, Path::new("/home")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OsExec);
    }

    #[tokio::test]
    async fn removing_a_missing_user_succeeds() {
        let mut host = MockHostOps::new();
        host.expect_run().times(2).returning(|_, _| Ok(exit(6)));
        remove_user(&host, "acme").await.unwrap();
    }

    #[tokio::test]
    async fn login_is_resolved_from_the_uid() {
        let mut host = MockHostOps::new();
        host.expect_run()
            .withf(|program, args| program == "id" && args[..] == ["-nu", "20001"])
            .returning(|_, _| {
                Ok(CommandOutput {
                    code: Some(0),
                    stdout: "acme\n".into(),
                    ..CommandOutput::default()
                })
            });
        host.expect_run()
            .withf(|program, args| program == "id" && args[..] == ["-nu", "20002"])
            .returning(|_, _| Ok(exit(1)));

        assert_eq!(user_name(&host, 20001).await.unwrap().as_deref(), Some("acme"));
        assert_eq!(user_name(&host, 20002).await.unwrap(), None);
    }
}
