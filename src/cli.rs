//! Administrative command interface.
//!
//! A line-oriented grammar executed against the control-plane state:
//!
//! ```text
//! create upf application <name>
//! delete upf application <name>
//! upf application <name> rule <id> add (ip src <ip> | ip dst <ip> |
//!                                       l7 http host <regex> path <regex>)
//! upf application <name> rule <id> del
//! show upf application <name>
//! show upf applications [verbose]
//! upf adf test db <id> url <bytes>
//! upf flow timeout default <seconds>
//! show upf flow timeout default
//! ```

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use uf_interface::{AdfDatabase, Error, Result};

use crate::apps::{AdrRule, App, AppRegistry};

pub struct CliContext {
    pub apps: Arc<Mutex<AppRegistry>>,
    pub flow_timeout: Arc<AtomicU32>,
}

pub fn execute(ctx: &CliContext, line: &str) -> Result<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["create", "upf", "application", name] => {
            ctx.apps.lock().app_add(name)?;
            Ok(format!("application {} created", name))
        }
        ["delete", "upf", "application", name] => {
            ctx.apps.lock().app_remove(name)?;
            Ok(format!("application {} deleted", name))
        }
        ["upf", "application", name, "rule", id, rest @ ..] => {
            let rule_id = parse_u32(id)?;
            rule_command(ctx, name, rule_id, rest)
        }
        ["show", "upf", "application", name] => {
            let apps = ctx.apps.lock();
            let app = apps.app_by_name(name).ok_or(Error::NotFound)?;
            Ok(show_rules(app))
        }
        ["show", "upf", "applications"] => Ok(show_apps(&ctx.apps.lock(), false)),
        ["show", "upf", "applications", "verbose"] => Ok(show_apps(&ctx.apps.lock(), true)),
        ["upf", "adf", "test", "db", id, "url", url] => {
            let handle = parse_u32(id)?;
            let apps = ctx.apps.lock();
            let db = apps.db(handle).ok_or(Error::NotFound)?;
            match db.scan(url.as_bytes()) {
                Some(app_id) => {
                    let name = apps
                        .get(app_id)
                        .map(|a| a.name.clone())
                        .unwrap_or_else(|| app_id.to_string());
                    Ok(format!("Matched app: {}", name))
                }
                None => Ok("No match found".to_string()),
            }
        }
        ["upf", "flow", "timeout", "default", seconds] => {
            let timeout = parse_u32(seconds)?;
            if timeout == 0 {
                return Err(Error::invalid("timeout must be non-zero"));
            }
            ctx.flow_timeout.store(timeout, Ordering::Relaxed);
            Ok(format!("flow timeout default {}", timeout))
        }
        ["show", "upf", "flow", "timeout", "default"] => {
            Ok(ctx.flow_timeout.load(Ordering::Relaxed).to_string())
        }
        [] => Ok(String::new()),
        _ => Err(Error::invalid(format!("unknown input `{}'", line))),
    }
}

fn rule_command(ctx: &CliContext, name: &str, rule_id: u32, rest: &[&str]) -> Result<String> {
    match rest {
        ["del"] => {
            match ctx.apps.lock().rule_remove(name, rule_id) {
                // An emptied application keeps no databases; the removal
                // itself still happened.
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
            Ok(format!("rule {} deleted", rule_id))
        }
        ["add", "ip", "src", ip] => {
            let rule = AdrRule {
                src_ip: Some(ip.parse().map_err(|_| Error::invalid("bad address"))?),
                ..AdrRule::default()
            };
            add_rule(ctx, name, rule_id, rule)
        }
        ["add", "ip", "dst", ip] => {
            let rule = AdrRule {
                dst_ip: Some(ip.parse().map_err(|_| Error::invalid("bad address"))?),
                ..AdrRule::default()
            };
            add_rule(ctx, name, rule_id, rule)
        }
        ["add", "l7", "http", "host", host, "path", path] => {
            let rule = AdrRule {
                host: Some((*host).to_string()),
                path: Some((*path).to_string()),
                ..AdrRule::default()
            };
            add_rule(ctx, name, rule_id, rule)
        }
        _ => Err(Error::invalid(format!("unknown input `{}'", rest.join(" ")))),
    }
}

fn add_rule(ctx: &CliContext, name: &str, rule_id: u32, rule: AdrRule) -> Result<String> {
    match ctx.apps.lock().rule_add(name, rule_id, rule) {
        // Rules without l7 patterns build no database; that is not a
        // failure of the add itself.
        Ok(()) | Err(Error::NotFound) => Ok(format!("rule {} added", rule_id)),
        Err(e) => Err(e),
    }
}

fn parse_u32(s: &str) -> Result<u32> {
    s.parse().map_err(|_| Error::invalid("expected a number"))
}

fn show_rules(app: &App) -> String {
    let mut out = String::new();
    for rule in app.rules.values() {
        let _ = writeln!(out, "rule: {}", rule.id);
        if let Some(host) = &rule.host {
            let _ = writeln!(out, "host: {}", host);
        }
        if let Some(path) = &rule.path {
            let _ = writeln!(out, "path: {}", path);
        }
        if let Some(ip) = rule.src_ip {
            let _ = writeln!(out, "ip src: {}", ip);
        }
        if let Some(ip) = rule.dst_ip {
            let _ = writeln!(out, "ip dst: {}", ip);
        }
    }
    out
}

fn show_apps(apps: &AppRegistry, verbose: bool) -> String {
    let mut out = String::new();
    for app in apps.iter() {
        let _ = writeln!(out, "app: {}", app.name);
        if verbose {
            out.push_str(&show_rules(app));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uf_interface::SessionTable;

    fn ctx() -> CliContext {
        CliContext {
            apps: Arc::new(Mutex::new(AppRegistry::new(Arc::new(SessionTable::new())))),
            flow_timeout: Arc::new(AtomicU32::new(60)),
        }
    }

    #[test]
    fn application_lifecycle() {
        let ctx = ctx();
        execute(&ctx, "create upf application video").unwrap();
        assert!(matches!(
            execute(&ctx, "create upf application video"),
            Err(Error::AlreadyExists)
        ));

        execute(
            &ctx,
            "upf application video rule 1 add l7 http host ^cdn\\.example\\.com$ path ^/v/",
        )
        .unwrap();

        let out = execute(&ctx, "show upf application video").unwrap();
        assert!(out.contains("rule: 1"));
        assert!(out.contains("host: ^cdn\\.example\\.com$"));
        assert!(out.contains("path: ^/v/"));

        let out = execute(&ctx, "show upf applications verbose").unwrap();
        assert!(out.contains("app: video"));
        assert!(out.contains("rule: 1"));

        execute(&ctx, "upf application video rule 1 del").unwrap();
        execute(&ctx, "delete upf application video").unwrap();
        assert!(matches!(
            execute(&ctx, "show upf application video"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn adf_test_scans_a_pooled_database() {
        let ctx = ctx();
        execute(&ctx, "create upf application video").unwrap();
        execute(
            &ctx,
            "upf application video rule 1 add l7 http host example path ^/v/",
        )
        .unwrap();

        let handle = {
            let apps = ctx.apps.lock();
            apps.app_by_name("video").unwrap().path_db.unwrap()
        };
        let cmd = format!("upf adf test db {} url /v/clip", handle);
        assert_eq!(execute(&ctx, &cmd).unwrap(), "Matched app: video");

        let cmd = format!("upf adf test db {} url /other", handle);
        assert_eq!(execute(&ctx, &cmd).unwrap(), "No match found");
    }

    #[test]
    fn ip_rules_do_not_need_databases() {
        let ctx = ctx();
        execute(&ctx, "create upf application blocklist").unwrap();
        execute(&ctx, "upf application blocklist rule 1 add ip dst 10.0.0.1").unwrap();
        let out = execute(&ctx, "show upf application blocklist").unwrap();
        assert!(out.contains("ip dst: 10.0.0.1"));
    }

    #[test]
    fn flow_timeout_round_trip() {
        let ctx = ctx();
        execute(&ctx, "upf flow timeout default 120").unwrap();
        assert_eq!(
            execute(&ctx, "show upf flow timeout default").unwrap(),
            "120"
        );
        assert!(execute(&ctx, "upf flow timeout default 0").is_err());
    }

    #[test]
    fn unknown_input_is_an_error() {
        let ctx = ctx();
        assert!(matches!(
            execute(&ctx, "upf frob everything"),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(execute(&ctx, "").unwrap(), "");
    }
}
