//! Map every active source user to a target account, creating the ones
//! that do not exist yet.

use anyhow::{bail, Result};

use ticket_migrate_core::context::RunContext;
use ticket_migrate_core::models::{NewUser, SourceUser, TargetUser};

use crate::audit::{self, UserRow};
use crate::config::Config;
use crate::tables;

use super::{previously_ok, PassEnv, PassReport, USERS_INPUT};

pub const PASS: &str = "users";

/// Domain left untouched by email mangling (and used for users without one).
const PLACEHOLDER_DOMAIN: &str = "example.org";

/// `john.doe@company.com` → `john.doe_@_company.com`, so accounts created
/// during the migration receive no mail. The admin address and
/// placeholder addresses are kept.
pub fn mangle_email(email: &str, admin_email: Option<&str>) -> String {
    if Some(email) == admin_email {
        return email.to_string();
    }
    match email.split_once('@') {
        Some((_, domain)) if domain == PLACEHOLDER_DOMAIN => email.to_string(),
        Some((local, domain)) => format!("{}_@_{}", local, domain),
        None => email.to_string(),
    }
}

/// Source login with any trailing `@domain` removed.
pub fn username(login: &str) -> &str {
    login.split('@').next().unwrap_or(login)
}

fn find_existing<'u>(existing: &'u [TargetUser], user: &SourceUser) -> Option<&'u TargetUser> {
    let name = username(&user.login);
    existing.iter().find(|t| {
        t.display_name.eq_ignore_ascii_case(name)
            || (!user.name.is_empty() && t.display_name.eq_ignore_ascii_case(&user.name))
            || (!user.email.is_empty()
                && t.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(&user.email)))
    })
}

fn new_user(user: &SourceUser, config: &Config) -> NewUser {
    let name = username(&user.login).to_string();
    let email = if user.email.trim().is_empty() {
        format!("{}@{}", name, PLACEHOLDER_DOMAIN)
    } else if config.accounts.mangle_emails {
        mangle_email(user.email.trim(), config.accounts.admin_email.as_deref())
    } else {
        user.email.trim().to_string()
    };
    let display_name = if user.name.trim().is_empty() {
        name.clone()
    } else {
        user.name.trim().to_string()
    };
    NewUser {
        name,
        email,
        display_name,
    }
}

/// The admin account must exist and be active before anything is created.
pub async fn verify_admin(env: &PassEnv<'_>) -> Result<TargetUser> {
    let admin_id = &env.config.accounts.admin_account_id;
    match env.api.get_user(admin_id).await? {
        Some(admin) if admin.active => Ok(admin),
        Some(_) => bail!("Admin account '{}' is not active, activate it first", admin_id),
        None => bail!("Admin account '{}' does not exist", admin_id),
    }
}

pub async fn run(env: &PassEnv<'_>, _ctx: &mut RunContext) -> Result<PassReport> {
    let config = env.config;
    let mut report = PassReport::new(PASS, env.opts.dry_run);
    env.preparing(PASS);

    let admin = verify_admin(env).await?;
    tracing::info!(admin = %admin.display_name, "admin account verified");

    let users: Vec<SourceUser> = tables::read_required_table(&config.input(USERS_INPUT), "export")?;
    let previous: Vec<UserRow> = tables::read_optional_table(&config.output(audit::USERS_LOG))?;
    let done = previously_ok(&previous, |r| &r.result, |r| &r.assembla_id);
    let mut existing = env.api.list_users().await?;
    tracing::info!(count = existing.len(), "target users listed");

    let window = env.window(PASS).await?;
    let mut log = env.audit(audit::USERS_LOG)?;
    let total = users.len() as u64;
    let mut created = 0;
    let mut inactive = Vec::new();

    for (i, user) in users.iter().enumerate() {
        let counter = i as u64 + 1;
        if !window.contains(counter) {
            continue;
        }
        env.processing(PASS, counter, total);
        if user.activity() == 0 || done.contains(&user.id) {
            report.record_skip();
            env.advance(PASS, counter).await?;
            continue;
        }

        let mut row = UserRow {
            assembla_id: user.id.clone(),
            assembla_login: user.login.clone(),
            counter,
            run_id: env.run_id.to_string(),
            ..UserRow::default()
        };
        let matched = find_existing(&existing, user).cloned();
        let result = match matched {
            Some(target) => Ok((target, false)),
            None if env.opts.dry_run => {
                let new = new_user(user, config);
                env.intend(format_args!("create user {} <{}>", new.display_name, new.email));
                report.record_ok();
                env.advance(PASS, counter).await?;
                continue;
            }
            None => env
                .api
                .create_user(&new_user(user, config))
                .await
                .map(|created| (created, true)),
        };

        match result {
            Ok((target, was_created)) => {
                row.result = audit::OK.into();
                row.account_id = target.account_id.clone();
                row.display_name = target.display_name.clone();
                row.email = target.email.clone().unwrap_or_else(|| user.email.clone());
                row.active = target.active;
                row.created = was_created;
                if was_created {
                    created += 1;
                    existing.push(target.clone());
                }
                if !target.active {
                    inactive.push(target.display_name.clone());
                }
                report.record_ok();
            }
            Err(e) => {
                row.result = audit::NOK.into();
                row.message = e.to_string();
                report.record_nok(&row.message);
            }
        }
        log.write(&row)?;
        env.advance(PASS, counter).await?;
        report.attempted(counter);
    }

    report.count("created users", created);
    report.count("inactive users", inactive.len() as u64);
    if !inactive.is_empty() {
        tracing::warn!(
            users = %inactive.join(", "),
            "inactive users must be activated before tickets are migrated"
        );
    }
    report.print();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::{testing, PassOptions};
    use tempfile::TempDir;
    use ticket_migrate_core::target::memory::InMemoryTarget;

    #[test]
    fn test_mangle_email() {
        assert_eq!(mangle_email("john.doe@company.com", None), "john.doe_@_company.com");
        assert_eq!(mangle_email("x@example.org", None), "x@example.org");
        assert_eq!(
            mangle_email("admin@company.com", Some("admin@company.com")),
            "admin@company.com"
        );
        assert_eq!(mangle_email("nobody", None), "nobody");
    }

    #[test]
    fn test_username_strips_domain() {
        assert_eq!(username("kiffin@gmail.com"), "kiffin");
        assert_eq!(username("kiffin"), "kiffin");
    }

    #[tokio::test]
    async fn test_missing_admin_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "");
        let pool = testing::memory_pool().await;
        let target = InMemoryTarget::new("EA");
        let env = testing::env(&config, &target, &pool, PassOptions::default());
        let err = run(&env, &mut RunContext::new("fallback")).await.unwrap_err();
        assert!(err.to_string().contains("Admin account 'admin' does not exist"));

        target.add_user("admin", "Admin", false);
        let err = run(&env, &mut RunContext::new("fallback")).await.unwrap_err();
        assert!(err.to_string().contains("not active"));
    }

    #[tokio::test]
    async fn test_matches_or_creates_users() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "");
        testing::write(
            &config.input(USERS_INPUT),
            "count,id,login,name,email\n\
             3,u1,alice,Alice Smith,alice@corp.com\n\
             0,u2,idle,Idle,idle@corp.com\n\
             5,u3,bob@corp.com,Bob,bob@corp.com\n",
        );
        let pool = testing::memory_pool().await;
        let target = InMemoryTarget::new("EA");
        target.add_user("admin", "Admin", true);
        target.add_user("acc-alice", "Alice Smith", true);
        let env = testing::env(&config, &target, &pool, PassOptions::default());

        let report = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(report.ok, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(target.calls("create_user"), 1);

        let rows: Vec<UserRow> = tables::read_table(&config.output(audit::USERS_LOG)).unwrap();
        assert_eq!(rows[0].account_id, "acc-alice");
        assert!(!rows[0].created);
        assert_eq!(rows[1].assembla_login, "bob@corp.com");
        assert_eq!(rows[1].email, "bob_@_corp.com");
        assert!(rows[1].created);

        // A second run leaves already mapped users alone.
        let again = run(&env, &mut RunContext::new("fallback")).await.unwrap();
        assert_eq!(again.ok, 0);
        assert_eq!(target.calls("create_user"), 1);
    }
}
