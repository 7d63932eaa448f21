pub mod app;

pub use app::App;

use clap::Parser;
use ibase::driver::memory::{ADMIN_PASSWORD, ADMIN_USER};
use std::io::Read;
use std::path::PathBuf;

/// Run SQL against an in-memory InterBase-style database
#[derive(Parser, Debug)]
#[command(name = "ibase", version, about)]
pub struct Args {
    /// Statements to run; read from --file or stdin when none are given
    pub sql: Vec<String>,

    /// Database to create (or restore into) and attach to
    #[arg(short, long, default_value = "employee.fdb")]
    pub database: String,

    #[arg(short, long, default_value = ADMIN_USER)]
    pub user: String,

    #[arg(short, long, default_value = ADMIN_PASSWORD)]
    pub password: String,

    /// Script file with `;`-separated statements
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Load the database from a backup file before running
    #[arg(long)]
    pub restore: Option<String>,

    /// Write the database to a backup file when done
    #[arg(long)]
    pub backup: Option<String>,

    /// Print result sets as JSON
    #[arg(long)]
    pub json: bool,
}

impl Args {
    /// Statements to run, in order
    pub fn statements(&self) -> anyhow::Result<Vec<String>> {
        let script = if !self.sql.is_empty() {
            self.sql.join(";\n")
        } else if let Some(path) = &self.file {
            std::fs::read_to_string(path)?
        } else {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            input
        };
        Ok(split_statements(&script))
    }
}

/// Split a script on `;`, ignoring separators inside string literals and
/// `--` comments.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                current.push(c);
            }
            '-' if !in_quote && chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            ';' if !in_quote => {
                statements.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    statements.push(current);

    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let script = "CREATE TABLE t (s VARCHAR(10));\n-- seed; data\nINSERT INTO t VALUES ('a;b');\n\nSELECT * FROM t";
        assert_eq!(
            split_statements(script),
            vec![
                "CREATE TABLE t (s VARCHAR(10))".to_string(),
                "INSERT INTO t VALUES ('a;b')".to_string(),
                "SELECT * FROM t".to_string(),
            ]
        );
    }

    #[test]
    fn test_split_statements_empty() {
        assert!(split_statements(" ;\n; ").is_empty());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["ibase", "SELECT 1 FROM RDB$DATABASE"]);
        assert_eq!(args.database, "employee.fdb");
        assert_eq!(args.user, ADMIN_USER);
        assert_eq!(args.statements().unwrap().len(), 1);
    }
}
