//! Database instance collection.
//!
//! Every running instance gets one SQL*Plus session; the catalog queries are
//! sent into it one after the other and each answer becomes a record named
//! `oracle/<sid>/<tag>.jsonp`.

use super::Context;
use crate::error::{Error, Result};
use crate::instances::running_instances;
use crate::session::{InteractiveSession, SessionSpec};
use crate::workers::RecordEmitter;
use model::{Record, Status};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Arguments for a local administrative connection.
pub const SQLPLUS_ARGS: [&str; 5] = ["-S", "-L", "/", "as", "sysdba"];

/// Output formatting sent before the first query.
const SESSION_SETUP: &str = "set pagesize 50000 linesize 32767 trimspool on trimout on\n\
set feedback off heading on tab off colsep '|'\n\
whenever sqlerror continue";

/// Parse oratab lines of the form `SID:ORACLE_HOME:FLAG`.
///
/// Comments, blank lines and wildcard entries are ignored; the first entry
/// for a SID wins.
pub fn parse_oratab(text: &str) -> BTreeMap<String, PathBuf> {
    let mut homes = BTreeMap::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let (Some(sid), Some(home)) = (fields.next(), fields.next()) else {
            continue;
        };
        if sid.is_empty() || sid == "*" || home.is_empty() {
            continue;
        }
        homes
            .entry(sid.to_string())
            .or_insert_with(|| PathBuf::from(home));
    }
    homes
}

pub fn read_oratab(path: &Path) -> BTreeMap<String, PathBuf> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_oratab(&text),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No oratab");
            BTreeMap::new()
        }
    }
}

pub fn sqlplus(home: &Path) -> PathBuf {
    home.join("bin").join("sqlplus")
}

/// ORACLE_HOME for an instance: oratab first, then the first given home
/// that has a SQL*Plus binary.
pub fn resolve_home(sid: &str, oratab: &BTreeMap<String, PathBuf>, homes: &[PathBuf]) -> Option<PathBuf> {
    oratab
        .get(sid)
        .cloned()
        .or_else(|| homes.iter().find(|home| sqlplus(home).is_file()).cloned())
}

pub struct DatabaseCollector<'a> {
    ctx: &'a Context,
    oratab: PathBuf,
}

impl<'a> DatabaseCollector<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            oratab: config::paths::oratab(),
        }
    }

    pub fn with_oratab(mut self, path: impl Into<PathBuf>) -> Self {
        self.oratab = path.into();
        self
    }

    /// Collect every running instance the options select.
    pub async fn collect(&self, emit: &mut dyn RecordEmitter) -> Result<()> {
        let options = &self.ctx.options;
        let instances: Vec<_> = running_instances()
            .into_iter()
            .filter(|instance| {
                let wanted = options.wants_instance(&instance.sid);
                if !wanted {
                    info!(sid = %instance.sid, "Instance excluded");
                }
                wanted
            })
            .collect();
        if instances.is_empty() {
            info!("No running database instances");
            return Ok(());
        }

        let oratab = read_oratab(&self.oratab);
        for instance in instances {
            let home = resolve_home(&instance.sid, &oratab, &options.orahome);
            self.collect_instance(&instance.sid, home.as_deref(), emit).await?;
        }
        Ok(())
    }

    fn session_spec(&self, sid: &str, home: &Path) -> SessionSpec {
        let timeout = self.ctx.options.timeouts.sql;
        SessionSpec::new(sqlplus(home))
            .args(SQLPLUS_ARGS)
            .working_dir(&self.ctx.options.tempdir)
            .env("ORACLE_HOME", home.display().to_string())
            .env("ORACLE_SID", sid)
            .timeout(timeout)
            .reply_timeout(timeout)
    }

    /// Run all queries against one instance.
    pub async fn collect_instance(
        &self,
        sid: &str,
        home: Option<&Path>,
        emit: &mut dyn RecordEmitter,
    ) -> Result<()> {
        let instance_record = |status| {
            Record::new(format!("oracle/{}/instance.jsonp", sid), status).with_meta("sid", sid)
        };

        let Some(home) = home else {
            warn!(sid = %sid, "No ORACLE_HOME found, instance skipped");
            return emit
                .emit(instance_record(Status::Skipped).with_meta("reason", "ORACLE_HOME not found"))
                .await;
        };

        info!(sid = %sid, home = %home.display(), "Collecting database instance");
        let mut session = match self.session_spec(sid, home).open().await {
            Ok(session) => session,
            Err(e) => {
                warn!(sid = %sid, error = %e, "Cannot start SQL*Plus");
                return emit
                    .emit(
                        instance_record(Status::Error)
                            .with_meta("oracle_home", home.display().to_string())
                            .with_meta("reason", e.to_string()),
                    )
                    .await;
            }
        };

        let result = self.run_queries(&mut session, sid, home, emit).await;
        session.close().await;
        result
    }

    async fn run_queries(
        &self,
        session: &mut InteractiveSession,
        sid: &str,
        home: &Path,
        emit: &mut dyn RecordEmitter,
    ) -> Result<()> {
        if let Err(e) = session.send(SESSION_SETUP).await {
            warn!(sid = %sid, error = %e, "Session setup failed");
            return emit
                .emit(
                    Record::new(format!("oracle/{}/instance.jsonp", sid), Status::Error)
                        .with_meta("sid", sid)
                        .with_meta("reason", e.to_string()),
                )
                .await;
        }

        for (tag, query) in &self.ctx.catalog.queries {
            let record = |status| {
                Record::new(format!("oracle/{}/{}.jsonp", sid, tag), status)
                    .with_meta("sid", sid)
                    .with_meta("oracle_home", home.display().to_string())
                    .with_meta("query", query.as_str())
            };
            debug!(sid = %sid, tag = %tag, "Running query");

            match session.send(query).await {
                Ok(reply) => emit.emit(record(Status::Ok).with_payload(reply)).await?,
                Err(e) => {
                    let status = match e {
                        Error::SessionTimeout(_) => Status::Timeout,
                        _ => Status::Error,
                    };
                    emit.emit(record(status).with_meta("reason", e.to_string())).await?;
                    // a session that timed out or died answers nothing more
                    warn!(sid = %sid, tag = %tag, error = %e, "Query failed, closing session");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORATAB: &str = "\
# comment
*:/u01/app/oracle/product/19/dbhome_1:N
ORCL:/u01/app/oracle/product/19/dbhome_1:Y
TEST:/u01/app/oracle/product/21/dbhome_1:N

ORCL:/other:N
broken
";

    #[test]
    fn test_parse_oratab() {
        let homes = parse_oratab(ORATAB);
        assert_eq!(homes.len(), 2);
        assert_eq!(homes["ORCL"], PathBuf::from("/u01/app/oracle/product/19/dbhome_1"));
        assert_eq!(homes["TEST"], PathBuf::from("/u01/app/oracle/product/21/dbhome_1"));
    }

    #[test]
    fn test_resolve_home() {
        let oratab = parse_oratab(ORATAB);
        assert_eq!(
            resolve_home("TEST", &oratab, &[]),
            Some(PathBuf::from("/u01/app/oracle/product/21/dbhome_1"))
        );
        assert_eq!(resolve_home("OTHER", &oratab, &[PathBuf::from("/nonexistent")]), None);

        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join("bin")).unwrap();
        std::fs::write(sqlplus(home.path()), b"").unwrap();
        assert_eq!(
            resolve_home("OTHER", &oratab, &[PathBuf::from("/nonexistent"), home.path().to_path_buf()]),
            Some(home.path().to_path_buf())
        );
    }
}
