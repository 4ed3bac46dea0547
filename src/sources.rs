use std::path::PathBuf;

use anyhow::Result;

use crate::config::Config;
use crate::passes::{
    ASSOCIATIONS_INPUT, ATTACHMENTS_LOG, COMMENTS_INPUT, CUSTOM_FIELDS_INPUT, MILESTONES_INPUT,
    TAGS_INPUT, TICKETS_INPUT, USERS_INPUT,
};
use crate::tables;

/// One table a pass reads from outside the audit logs.
#[derive(Debug)]
pub struct SourceTable {
    pub name: String,
    pub path: PathBuf,
    /// Pass that fails without the table, if any.
    pub required_by: Option<&'static str>,
    /// Data rows, `None` when the file does not exist.
    pub rows: Option<usize>,
}

pub fn source_tables(config: &Config) -> Result<Vec<SourceTable>> {
    let mut wanted: Vec<(String, PathBuf, Option<&'static str>)> = vec![
        (USERS_INPUT.into(), config.input(USERS_INPUT), Some("users")),
        (TICKETS_INPUT.into(), config.input(TICKETS_INPUT), Some("tickets")),
        (COMMENTS_INPUT.into(), config.input(COMMENTS_INPUT), Some("comments")),
        (ASSOCIATIONS_INPUT.into(), config.input(ASSOCIATIONS_INPUT), None),
        (CUSTOM_FIELDS_INPUT.into(), config.input(CUSTOM_FIELDS_INPUT), None),
        (TAGS_INPUT.into(), config.input(TAGS_INPUT), None),
        (MILESTONES_INPUT.into(), config.input(MILESTONES_INPUT), None),
        (ATTACHMENTS_LOG.into(), config.output(ATTACHMENTS_LOG), None),
    ];
    if let Some(path) = &config.repos.table {
        wanted.push(("repos".into(), path.clone(), None));
    }
    if let Some(path) = &config.source.spaces_table {
        wanted.push(("spaces".into(), path.clone(), None));
    }

    wanted
        .into_iter()
        .map(|(name, path, required_by)| {
            let rows = tables::count_rows(&path)?;
            Ok(SourceTable {
                name,
                path,
                required_by,
                rows,
            })
        })
        .collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    let tables = source_tables(config)?;

    println!("{:<32} {:<10} {:>8}  PATH", "TABLE", "STATUS", "ROWS");
    for t in &tables {
        let (status, rows) = match (t.rows, t.required_by) {
            (Some(n), _) => ("OK".to_string(), n.to_string()),
            (None, Some(pass)) => (format!("MISSING ({})", pass), "-".to_string()),
            (None, None) => ("absent".to_string(), "-".to_string()),
        };
        println!("{:<32} {:<10} {:>8}  {}", t.name, status, rows, t.path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::testing;
    use tempfile::TempDir;

    #[test]
    fn test_source_tables() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(&tmp, "[repos]\ntable = \"repos.csv\"\n");
        testing::write(&config.input(TICKETS_INPUT), "id,number\nt1,1\nt2,2\n");

        let tables = source_tables(&config).unwrap();
        assert_eq!(tables.len(), 9);
        let tickets = tables.iter().find(|t| t.name == TICKETS_INPUT).unwrap();
        assert_eq!(tickets.rows, Some(2));
        assert_eq!(tickets.required_by, Some("tickets"));
        let users = tables.iter().find(|t| t.name == USERS_INPUT).unwrap();
        assert_eq!(users.rows, None);
        assert_eq!(tables.last().unwrap().name, "repos");
    }
}
