use super::Args;
use anyhow::{Context, Result};
use ibase::{
    AdminService, BackupOptions, Connection, ConnectionConfig, DbInfoAction, Execution, MemoryDriver,
    QueryResult, TransactionOptions,
};
use log::{error, info, warn};

pub struct App {
    conn: Connection,
    service: AdminService,
    database: String,
    json: bool,
}

impl App {
    pub fn new(args: &Args) -> Result<Self> {
        let driver = MemoryDriver::new().into_shared();
        let service = AdminService::attach(driver.clone(), "localhost", &args.user, &args.password)
            .context("attaching to the service manager")?;

        match &args.restore {
            Some(file) => {
                service
                    .restore(file, &args.database, BackupOptions::CREATE | BackupOptions::REPLACE, false)
                    .with_context(|| format!("restoring {}", file))?;
            }
            None => driver.borrow_mut().create_database(&args.database)?,
        }

        let config = ConnectionConfig::new(&args.database).credentials(&args.user, &args.password);
        let conn = Connection::open(driver, config)
            .with_context(|| format!("attaching to {}", args.database))?;

        Ok(Self {
            conn,
            service,
            database: args.database.clone(),
            json: args.json,
        })
    }

    /// Run every statement, reporting failures as they happen
    pub fn run(&mut self, statements: &[String]) -> Result<usize> {
        let mut failed = 0;
        for sql in statements {
            if let Err(e) = self.execute(sql) {
                error!("{}", sql);
                eprintln!("error: {}", e);
                failed += 1;
            }
        }
        Ok(failed)
    }

    fn execute(&mut self, sql: &str) -> Result<()> {
        match sql.to_uppercase().as_str() {
            "BEGIN" | "SET TRANSACTION" => {
                self.conn.begin(TransactionOptions::empty())?;
                println!("Transaction started");
                return Ok(());
            }
            "COMMIT" => {
                self.conn.commit()?;
                println!("Committed");
                return Ok(());
            }
            "ROLLBACK" => {
                self.conn.rollback()?;
                println!("Rolled back");
                return Ok(());
            }
            "SHOW TABLES" => return self.show(DbInfoAction::Tables),
            "SHOW DATABASE" => return self.show(DbInfoAction::Statistics),
            _ => {}
        }

        match self.conn.query(sql)? {
            Execution::Cursor(mut rs) => {
                let result = QueryResult::collect(&mut rs)?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&result.to_json())?);
                } else {
                    result.print();
                }
            }
            Execution::Scalar(count) => println!("{} row(s) affected", count),
            Execution::NoResult => println!("OK"),
        }
        Ok(())
    }

    fn show(&self, action: DbInfoAction) -> Result<()> {
        for line in self.service.db_info(&self.database, action, 0)?.lines() {
            println!("{}", line);
        }
        Ok(())
    }

    /// Commit outstanding work, detach, and write the backup if one was asked for
    pub fn finish(mut self, backup: Option<&str>) -> Result<()> {
        if self.conn.in_transaction() {
            warn!("committing open transaction on exit");
            self.conn.commit()?;
        }
        self.conn.close()?;

        if let Some(file) = backup {
            let reply = self
                .service
                .backup(&self.database, file, BackupOptions::empty(), true)
                .with_context(|| format!("backing up to {}", file))?;
            for line in reply.lines() {
                info!("{}", line);
            }
        }
        self.service.detach()?;
        Ok(())
    }
}
