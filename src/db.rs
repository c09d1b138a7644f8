use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::ValueEnum;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_derive::Serialize;

/// Book file variants Downpour offers for download.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum FileType {
    M4b,
    Zip,
}

impl FileType {
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::M4b => "m4b",
            FileType::Zip => "zip",
        }
    }

    fn from_column(value: &str) -> FileType {
        match value {
            "zip" => FileType::Zip,
            _ => FileType::M4b,
        }
    }
}

/// One stored Downpour identity.
#[derive(Debug, Clone)]
pub struct Account {
    pub email: String,
    pub password: Vec<u8>,
    pub file_type: FileType,
    pub folder_template: String,
    pub download_dir: String,
    pub session: Option<Vec<u8>>,
}

/// One item in the purchased library.
#[derive(Debug, Clone, Serialize)]
pub struct Book {
    pub book_id: String,
    pub item_id: i64,
    pub sku: String,
    pub title: String,
    pub author: String,
    pub drm: bool,
    pub is_released: bool,
    pub is_rental: bool,
    pub purchase_date: NaiveDateTime,
    pub release_date: NaiveDate,
    pub runtime: f64,
    pub url: String,
    pub cover: String,
}

impl Book {
    /// Pipe-delimited author column rendered for display.
    pub fn author_display(&self) -> String {
        self.author.split('|').collect::<Vec<_>>().join(", ")
    }
}

/// Local catalog cache backed by a single SQLite file.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("unable to open database {}", path.display()))?;
        let store = Store { conn };
        store.init()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let store = Store {
            conn: Connection::open_in_memory()?,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS account (
                    email           TEXT PRIMARY KEY,
                    password        BLOB NOT NULL,
                    file_type       TEXT NOT NULL DEFAULT 'm4b',
                    folder_template TEXT NOT NULL DEFAULT '{author}/{title}',
                    download_dir    TEXT NOT NULL,
                    session         BLOB,
                    last_updated    TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                );
                CREATE TABLE IF NOT EXISTS books (
                    book_id       TEXT NOT NULL,
                    item_id       INTEGER NOT NULL,
                    sku           TEXT NOT NULL,
                    title         TEXT NOT NULL,
                    author        TEXT NOT NULL,
                    drm           INTEGER NOT NULL,
                    is_released   INTEGER NOT NULL,
                    is_rental     INTEGER NOT NULL,
                    purchase_date TEXT NOT NULL,
                    release_date  TEXT NOT NULL,
                    runtime       REAL NOT NULL,
                    url           TEXT NOT NULL,
                    cover         TEXT NOT NULL,
                    last_updated  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    PRIMARY KEY (book_id, item_id, sku)
                );",
            )
            .context("unable to initialize database schema")
    }

    pub fn accounts(&self) -> Result<Vec<Account>> {
        let mut stmt = self.conn.prepare(
            "SELECT email, password, file_type, folder_template, download_dir, session
             FROM account ORDER BY email",
        )?;
        let accounts = stmt
            .query_map([], account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    pub fn account_by_email(&self, email: &str) -> Result<Option<Account>> {
        self.conn
            .query_row(
                "SELECT email, password, file_type, folder_template, download_dir, session
                 FROM account WHERE email = ?1",
                params![email],
                account_from_row,
            )
            .optional()
            .context("unable to query account")
    }

    pub fn insert_account(&self, account: &Account) -> Result<()> {
        self.conn.execute(
            "INSERT INTO account (email, password, file_type, folder_template, download_dir, session)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account.email,
                account.password,
                account.file_type.extension(),
                account.folder_template,
                account.download_dir,
                account.session,
            ],
        )?;
        Ok(())
    }

    pub fn update_password(&self, email: &str, password: &[u8]) -> Result<()> {
        self.conn.execute(
            "UPDATE account SET password = ?1, last_updated = CURRENT_TIMESTAMP WHERE email = ?2",
            params![password, email],
        )?;
        Ok(())
    }

    pub fn update_session(&self, email: &str, session: &[u8]) -> Result<()> {
        self.conn.execute(
            "UPDATE account SET session = ?1, last_updated = CURRENT_TIMESTAMP WHERE email = ?2",
            params![session, email],
        )?;
        Ok(())
    }

    pub fn set_file_type(&self, email: &str, file_type: FileType) -> Result<()> {
        self.conn.execute(
            "UPDATE account SET file_type = ?1, last_updated = CURRENT_TIMESTAMP WHERE email = ?2",
            params![file_type.extension(), email],
        )?;
        Ok(())
    }

    pub fn set_folder_template(&self, email: &str, template: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE account SET folder_template = ?1, last_updated = CURRENT_TIMESTAMP
             WHERE email = ?2",
            params![template, email],
        )?;
        Ok(())
    }

    pub fn set_download_dir(&self, email: &str, dir: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE account SET download_dir = ?1, last_updated = CURRENT_TIMESTAMP
             WHERE email = ?2",
            params![dir, email],
        )?;
        Ok(())
    }

    /// Inserts a scraped book unless one with the same ID is already cached.
    /// Existing rows are never updated; returns whether a row was added.
    pub fn insert_book(&self, book: &Book) -> Result<bool> {
        if self.book(&book.book_id)?.is_some() {
            return Ok(false);
        }
        self.conn.execute(
            "INSERT INTO books (book_id, item_id, sku, title, author, drm, is_released,
                                is_rental, purchase_date, release_date, runtime, url, cover)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                book.book_id,
                book.item_id,
                book.sku,
                book.title,
                book.author,
                book.drm,
                book.is_released,
                book.is_rental,
                book.purchase_date,
                book.release_date,
                book.runtime,
                book.url,
                book.cover,
            ],
        )?;
        Ok(true)
    }

    pub fn book(&self, book_id: &str) -> Result<Option<Book>> {
        self.conn
            .query_row(
                "SELECT book_id, item_id, sku, title, author, drm, is_released, is_rental,
                        purchase_date, release_date, runtime, url, cover
                 FROM books WHERE book_id = ?1",
                params![book_id],
                book_from_row,
            )
            .optional()
            .context("unable to query book")
    }

    /// Lists cached books ordered by purchase date, optionally filtered by a
    /// title/author substring search. A limit of zero means no limit.
    pub fn list_books(&self, limit: u32, search: Option<&str>, asc: bool) -> Result<Vec<Book>> {
        let order = if asc { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT book_id, item_id, sku, title, author, drm, is_released, is_rental,
                    purchase_date, release_date, runtime, url, cover
             FROM books
             WHERE (?1 IS NULL OR title LIKE ?1 OR author LIKE ?1)
             ORDER BY purchase_date {order}
             LIMIT ?2"
        );
        let pattern = search.map(|s| format!("%{s}%"));
        let limit = if limit == 0 { -1 } else { limit as i64 };

        let mut stmt = self.conn.prepare(&sql)?;
        let books = stmt
            .query_map(params![pattern, limit], book_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(books)
    }
}

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    let file_type: String = row.get(2)?;
    Ok(Account {
        email: row.get(0)?,
        password: row.get(1)?,
        file_type: FileType::from_column(&file_type),
        folder_template: row.get(3)?,
        download_dir: row.get(4)?,
        session: row.get(5)?,
    })
}

fn book_from_row(row: &Row) -> rusqlite::Result<Book> {
    Ok(Book {
        book_id: row.get(0)?,
        item_id: row.get(1)?,
        sku: row.get(2)?,
        title: row.get(3)?,
        author: row.get(4)?,
        drm: row.get(5)?,
        is_released: row.get(6)?,
        is_rental: row.get(7)?,
        purchase_date: row.get(8)?,
        release_date: row.get(9)?,
        runtime: row.get(10)?,
        url: row.get(11)?,
        cover: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_book(book_id: &str, title: &str) -> Book {
        Book {
            book_id: book_id.to_string(),
            item_id: 99,
            sku: format!("SKU-{book_id}"),
            title: title.to_string(),
            author: "Ann Author|Bob Cowriter".to_string(),
            drm: false,
            is_released: true,
            is_rental: false,
            purchase_date: NaiveDate::from_ymd_opt(2021, 6, 1)
                .unwrap()
                .and_hms_opt(14, 30, 0)
                .unwrap(),
            release_date: NaiveDate::from_ymd_opt(2020, 11, 3).unwrap(),
            runtime: 11.5,
            url: "https://www.downpour.com/some-book".to_string(),
            cover: "https://cdn.downpour.com/covers/some-book.jpg".to_string(),
        }
    }

    #[test]
    fn insert_and_fetch_book() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.insert_book(&sample_book("123", "A Book")).unwrap());

        let book = store.book("123").unwrap().unwrap();
        assert_eq!(book.title, "A Book");
        assert_eq!(book.runtime, 11.5);
        assert_eq!(book.author_display(), "Ann Author, Bob Cowriter");
        assert!(store.book("999").unwrap().is_none());
    }

    #[test]
    fn duplicate_book_id_is_skipped_and_unmodified() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.insert_book(&sample_book("123", "Original")).unwrap());

        // A later scrape of the same ID must neither duplicate nor update.
        let mut rescrape = sample_book("123", "Changed Title");
        rescrape.runtime = 2.0;
        assert!(!store.insert_book(&rescrape).unwrap());

        let books = store.list_books(0, None, false).unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].title, "Original");
        assert_eq!(books[0].runtime, 11.5);
    }

    #[test]
    fn list_search_and_order() {
        let store = Store::open_in_memory().unwrap();
        let mut early = sample_book("1", "Alpha");
        early.purchase_date = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let late = sample_book("2", "Beta");
        store.insert_book(&early).unwrap();
        store.insert_book(&late).unwrap();

        let newest_first = store.list_books(0, None, false).unwrap();
        assert_eq!(newest_first[0].book_id, "2");
        let oldest_first = store.list_books(0, None, true).unwrap();
        assert_eq!(oldest_first[0].book_id, "1");

        let hits = store.list_books(0, Some("Alph"), false).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Alpha");

        let by_author = store.list_books(0, Some("Cowriter"), false).unwrap();
        assert_eq!(by_author.len(), 2);

        let limited = store.list_books(1, None, false).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn account_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let account = Account {
            email: "reader@example.com".to_string(),
            password: vec![1, 2, 3],
            file_type: FileType::M4b,
            folder_template: "{author}/{title}".to_string(),
            download_dir: "/tmp/audiobooks".to_string(),
            session: None,
        };
        store.insert_account(&account).unwrap();

        let loaded = store.account_by_email("reader@example.com").unwrap().unwrap();
        assert_eq!(loaded.password, vec![1, 2, 3]);
        assert_eq!(loaded.file_type, FileType::M4b);
        assert!(loaded.session.is_none());

        store.update_session("reader@example.com", &[9, 9]).unwrap();
        store.set_file_type("reader@example.com", FileType::Zip).unwrap();
        store.set_download_dir("reader@example.com", "/mnt/books").unwrap();

        let loaded = store.account_by_email("reader@example.com").unwrap().unwrap();
        assert_eq!(loaded.session.as_deref(), Some(&[9u8, 9][..]));
        assert_eq!(loaded.file_type, FileType::Zip);
        assert_eq!(loaded.download_dir, "/mnt/books");
        assert_eq!(store.accounts().unwrap().len(), 1);
    }
}
