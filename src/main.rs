mod client;
mod config;
mod db;
mod secrets;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use crate::client::{Client, FilePart};
use crate::config::Config;
use crate::db::{Account, Book, FileType, Store};
use crate::secrets::Cipher;

#[derive(Debug, Parser)]
#[command(name = "downpour")]
#[command(version)]
#[command(about = "Manage and download your Downpour audiobook library", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage your Downpour account
    #[command(subcommand)]
    Account(AccountCommands),

    /// Manage your Downpour books
    #[command(subcommand)]
    Books(BookCommands),
}

#[derive(Debug, Subcommand)]
enum AccountCommands {
    /// Login with your Downpour credentials
    Login {
        #[arg(short, long)]
        email: Option<String>,

        #[arg(short, long)]
        password: Option<String>,
    },

    /// Update account information
    Update {
        /// Book file type to download
        #[arg(long, value_enum)]
        file_type: Option<FileType>,

        /// Download folder structure template; variables: {author}, {title}, {book_id}
        #[arg(long)]
        folder_template: Option<String>,

        /// Path where files will be downloaded
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },

    /// Display account information
    Show,
}

#[derive(Debug, Subcommand)]
enum BookCommands {
    /// Show all available books
    List {
        /// Number of books to show, 0 for all
        #[arg(short, long, default_value_t = 10)]
        number: u32,

        /// Update the list of books first
        #[arg(short, long)]
        refresh: bool,

        /// Search books by title and/or author
        #[arg(short, long)]
        search: Option<String>,

        /// Display the book list as JSON
        #[arg(short, long)]
        json: bool,

        /// Sort ascending by purchase date
        #[arg(short, long)]
        asc: bool,
    },

    /// Update the list of books
    Update {
        /// List any newly added books
        #[arg(short, long)]
        list: bool,
    },

    /// Show book details by ID
    Show { book_id: String },

    /// Download book(s) by ID(s)
    Download {
        /// Download without confirmation
        #[arg(short, long)]
        yes: bool,

        /// Folder to download file(s) to
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Book file type to download
        #[arg(short, long, value_enum)]
        file_type: Option<FileType>,

        #[arg(value_name = "BOOK_ID", required = true)]
        book_ids: Vec<String>,
    },

    /// Open the web page for a book
    Open { book_id: String },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .format_timestamp(None)
        .init();

    let args = Cli::parse();
    if let Err(err) = run(args) {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run(args: Cli) -> Result<()> {
    let config = Config::load()?;
    let cipher = Cipher::from_key_file(&config.key_path)?;
    let store = Store::open(&config.db_path)?;
    let app = App {
        config,
        cipher,
        store,
    };

    match args.command {
        Commands::Account(command) => match command {
            AccountCommands::Login { email, password } => app.account_login(email, password),
            AccountCommands::Update {
                file_type,
                folder_template,
                download_dir,
            } => app.account_update(file_type, folder_template, download_dir),
            AccountCommands::Show => app.account_show(),
        },
        Commands::Books(command) => match command {
            BookCommands::List {
                number,
                refresh,
                search,
                json,
                asc,
            } => app.books_list(number, refresh, search.as_deref(), json, asc),
            BookCommands::Update { list } => app.books_update(list),
            BookCommands::Show { book_id } => app.books_show(&book_id),
            BookCommands::Download {
                yes,
                dest,
                file_type,
                book_ids,
            } => app.books_download(&book_ids, dest.as_deref(), file_type, yes),
            BookCommands::Open { book_id } => app.books_open(&book_id),
        },
    }
}

struct App {
    config: Config,
    cipher: Cipher,
    store: Store,
}

impl App {
    /// Guard for every operation that talks to the site: returns an account
    /// with a cookie jar the server currently accepts, logging in again only
    /// when the live probe says the stored session is no longer usable.
    fn ensure_session(&self) -> Result<(Account, Client)> {
        let mut account = self.current_account()?;
        let client = Client::with_session(account.session.as_deref());
        if client.is_session_valid() {
            return Ok((account, client));
        }

        let password = self.cipher.decode(&account.password)?;
        client.login(&account.email, &password)?;

        let session = client.session_blob()?;
        self.store.update_session(&account.email, &session)?;
        account.session = Some(session);
        Ok((account, client))
    }

    /// Picks the account to operate on, prompting when several are stored.
    fn current_account(&self) -> Result<Account> {
        let mut accounts = self.store.accounts()?;
        match accounts.len() {
            0 => bail!("please login to your account first"),
            1 => Ok(accounts.remove(0)),
            _ => {
                println!("Multiple accounts found:");
                for (idx, account) in accounts.iter().enumerate() {
                    println!(" [{idx}] {}", account.email);
                }
                let answer = prompt_line("\nEnter account number")?;
                let idx = answer
                    .parse::<usize>()
                    .ok()
                    .filter(|idx| *idx < accounts.len())
                    .ok_or_else(|| anyhow!("invalid account selection: {answer}"))?;
                Ok(accounts.remove(idx))
            }
        }
    }

    fn account_login(&self, email: Option<String>, password: Option<String>) -> Result<()> {
        let email = match email {
            Some(email) => email,
            None => prompt_line("Email")?,
        };
        let password = match password {
            Some(password) => password,
            None => rpassword::prompt_password("Password: ").context("unable to read password")?,
        };

        let client = Client::new();
        client.login(&email, &password)?;
        let session = client.session_blob()?;

        match self.store.account_by_email(&email)? {
            None => {
                self.store.insert_account(&Account {
                    email,
                    password: self.cipher.encode(&password)?,
                    file_type: FileType::M4b,
                    folder_template: "{author}/{title}".to_string(),
                    download_dir: self.config.default_download_dir.display().to_string(),
                    session: Some(session),
                })?;
                info!("Successfully logged in!");
            }
            Some(account) => {
                if confirm("Confirm password change")? {
                    self.store
                        .update_password(&account.email, &self.cipher.encode(&password)?)?;
                    self.store.update_session(&account.email, &session)?;
                    info!("Successfully updated password!");
                }
            }
        }
        Ok(())
    }

    fn account_update(
        &self,
        file_type: Option<FileType>,
        folder_template: Option<String>,
        download_dir: Option<PathBuf>,
    ) -> Result<()> {
        if file_type.is_none() && folder_template.is_none() && download_dir.is_none() {
            bail!("nothing to update; see downpour account update --help");
        }
        let (account, _) = self.ensure_session()?;

        if let Some(file_type) = file_type {
            self.store.set_file_type(&account.email, file_type)?;
            info!("Set file type to: {}", file_type.extension());
        }
        if let Some(template) = folder_template {
            self.store.set_folder_template(&account.email, &template)?;
            info!("Set folder template to: {template}");
        }
        if let Some(dir) = download_dir {
            if !dir.is_dir() {
                bail!("folder does not exist: {}", dir.display());
            }
            self.store
                .set_download_dir(&account.email, &dir.display().to_string())?;
            info!("Set download path to: {}", dir.display());
        }
        Ok(())
    }

    fn account_show(&self) -> Result<()> {
        let (account, _) = self.ensure_session()?;
        println!("{:>15}: {}", "Email", account.email);
        println!("{:>15}: {}", "Password", "*********** [hidden for security]");
        println!("{:>15}: {}", "Download Path", account.download_dir);
        println!("{:>15}: {}", "Folder Template", account.folder_template);
        println!("{:>15}: {}", "File Type", account.file_type.extension());
        Ok(())
    }

    /// Scrapes the library page and caches any books not seen before.
    /// Already-cached books are left untouched.
    fn update_books(&self, client: &Client) -> Result<Vec<Book>> {
        let mut added = Vec::new();
        for book in client.fetch_library()? {
            if self.store.insert_book(&book)? {
                added.push(book);
            }
        }
        Ok(added)
    }

    fn books_update(&self, list: bool) -> Result<()> {
        let (_, client) = self.ensure_session()?;
        let added = self.update_books(&client)?;
        if added.is_empty() {
            info!("No new books found.");
            return Ok(());
        }
        info!("Added {} new book(s)!", added.len());
        if list {
            println!("{}", format_book_list(&added));
        }
        Ok(())
    }

    fn books_list(
        &self,
        number: u32,
        refresh: bool,
        search: Option<&str>,
        json: bool,
        asc: bool,
    ) -> Result<()> {
        if refresh {
            let (_, client) = self.ensure_session()?;
            self.update_books(&client)?;
        }

        let books = self.store.list_books(number, search, asc)?;
        if books.is_empty() {
            warn!("No books found.");
            return Ok(());
        }

        if json {
            println!("{}", ureq::serde_json::to_string(&books)?);
        } else {
            println!("{}", format_book_list(&books));
        }
        Ok(())
    }

    fn books_show(&self, book_id: &str) -> Result<()> {
        let book = self.get_book(book_id)?;
        println!("{:>15}: {}", "Title", book.title);
        println!("{:>15}: {}", "Author(s)", book.author_display());
        println!("{:>15}: {} hours", "Runtime", book.runtime);
        println!(
            "{:>15}: {}",
            "Purchase Date",
            book.purchase_date.format("%d %B %Y")
        );
        println!("{:>15}: {}", "Released", yes_no(book.is_released));
        println!("{:>15}: {}", "Rental", yes_no(book.is_rental));
        println!("{:>15}: {}", "DRM", yes_no(book.drm));
        println!("{:>15}: {}", "Link", book.url);
        Ok(())
    }

    fn books_download(
        &self,
        book_ids: &[String],
        dest: Option<&Path>,
        file_type: Option<FileType>,
        yes: bool,
    ) -> Result<()> {
        let (account, client) = self.ensure_session()?;

        // One bad book does not abort the rest of the batch.
        for book_id in book_ids {
            let result = self
                .get_book(book_id)
                .and_then(|book| self.download_book(&account, &client, &book, dest, file_type, yes));
            if let Err(err) = result {
                error!("{err:#}");
            }
        }
        Ok(())
    }

    fn download_book(
        &self,
        account: &Account,
        client: &Client,
        book: &Book,
        dest: Option<&Path>,
        file_type: Option<FileType>,
        yes: bool,
    ) -> Result<()> {
        let file_type = file_type.unwrap_or(account.file_type);
        let parts = client.book_manifest(&book.book_id, file_type.extension())?;
        if parts.is_empty() {
            bail!("no .{} files found for this book", file_type.extension());
        }

        let book_dir = book_download_dir(account, book, dest)?;
        let count = parts.len();
        let files = if count > 1 { "files" } else { "file" };
        if yes {
            println!("Downloading {count} {files} to {}", book_dir.display());
        } else if !confirm(&format!("Download {count} {files} to {}?", book_dir.display()))? {
            return Ok(());
        }

        for part in &parts {
            let file_path = book_dir.join(part_file_name(part, count));
            download_book_file(client, part, &file_path)?;
        }
        Ok(())
    }

    fn books_open(&self, book_id: &str) -> Result<()> {
        let book = self.get_book(book_id)?;
        println!("Opening {}", book.url);
        opener::open(&book.url).with_context(|| format!("unable to open {}", book.url))?;
        Ok(())
    }

    fn get_book(&self, book_id: &str) -> Result<Book> {
        self.store
            .book(book_id)?
            .ok_or_else(|| anyhow!("no book found for ID: {book_id}"))
    }
}

/// Downloads one file part, skipping without error when the destination
/// already exists. The signed URL is single-use, so it is only resolved
/// once the file is known to be missing and the folder writable.
fn download_book_file(client: &Client, part: &FilePart, path: &Path) -> Result<()> {
    if path.is_file() {
        warn!("File \"{}\" exists, skipping", path.display());
        return Ok(());
    }

    let folder = path
        .parent()
        .ok_or_else(|| anyhow!("invalid download path: {}", path.display()))?;
    check_folder_permissions(folder)?;

    let url = client.download_url(part)?;
    println!("Downloading {}", path.display());
    client.download_to(&url, path)?;

    if !path.is_file() {
        bail!("unable to download file: {}", path.display());
    }
    Ok(())
}

/// Resolves and creates the per-book download folder from the account's
/// folder-name template.
fn book_download_dir(account: &Account, book: &Book, dest: Option<&Path>) -> Result<PathBuf> {
    let base = match dest {
        Some(dest) => dest.to_path_buf(),
        None => PathBuf::from(&account.download_dir),
    };
    let book_dir = base.join(expand_folder_template(&account.folder_template, book));
    if !book_dir.is_dir() {
        fs::create_dir_all(&book_dir)
            .with_context(|| format!("unable to create folder: {}", book_dir.display()))?;
    }
    Ok(book_dir)
}

fn expand_folder_template(template: &str, book: &Book) -> String {
    template
        .replace("{title}", &book.title)
        .replace("{author}", &book.author_display())
        .replace("{book_id}", &book.book_id)
}

fn part_file_name(part: &FilePart, total: usize) -> String {
    if total > 1 {
        format!("{}, Part {}.{}", part.title, part.part, part.ext)
    } else {
        format!("{}.{}", part.title, part.ext)
    }
}

fn check_folder_permissions(folder: &Path) -> Result<()> {
    let metadata = fs::metadata(folder)
        .with_context(|| format!("folder does not exist: {}", folder.display()))?;
    if !metadata.is_dir() {
        bail!("not a folder: {}", folder.display());
    }
    if metadata.permissions().readonly() {
        bail!("unable to read/write folder: {}", folder.display());
    }
    Ok(())
}

fn format_book_list(books: &[Book]) -> String {
    const HEADERS: [&str; 5] = ["ID", "Title", "Author", "Runtime", "Purchased"];

    let rows: Vec<[String; 5]> = books
        .iter()
        .map(|book| {
            [
                book.book_id.clone(),
                shorten(&book.title, 50),
                shorten(&book.author_display(), 50),
                format!("{} hr", book.runtime),
                book.purchase_date.format("%d %b %y").to_string(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let format_row = |cells: [&str; 5]| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![format_row(HEADERS)];
    lines.push(
        widths
            .map(|width| "-".repeat(width))
            .join("  "),
    );
    for row in &rows {
        lines.push(format_row([
            row[0].as_str(),
            row[1].as_str(),
            row[2].as_str(),
            row[3].as_str(),
            row[4].as_str(),
        ]));
    }
    lines.join("\n")
}

fn shorten(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let cut: String = text.chars().take(width - 3).collect();
    format!("{}...", cut.trim_end())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{prompt}: ");
    io::stdout().flush().context("unable to write prompt")?;
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("unable to read input")?;
    Ok(line.trim().to_string())
}

fn confirm(prompt: &str) -> Result<bool> {
    let answer = prompt_line(&format!("{prompt} [y/N]"))?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}
