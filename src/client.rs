use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use cookie_store::CookieStore;
use log::warn;
use ml_progress::progress;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use ureq::serde_json::Value;

use crate::db::Book;

const DEFAULT_BASE_URL: &str = "https://www.downpour.com";
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:89.0) \
                          Gecko/20100101 Firefox/89.0";
const DOWNLOAD_CHUNK: usize = 16 * 1024;

/// One downloadable chunk of a book, ordered by its "File N of M" label.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    pub filename: String,
    pub pretty_name: String,
    pub title: String,
    pub part: u32,
    pub ext: String,
}

/// Blocking HTTP client for Downpour, carrying the session cookie jar.
pub struct Client {
    agent: ureq::Agent,
    base_url: String,
}

impl Client {
    /// Builds a client, restoring the cookie jar from a previously stored
    /// session blob. An unreadable blob degrades to an empty jar, which
    /// simply forces a fresh login.
    pub fn with_session(session: Option<&[u8]>) -> Client {
        let store = session
            .and_then(|blob| match CookieStore::load_json(blob) {
                Ok(store) => Some(store),
                Err(err) => {
                    warn!("ignoring unreadable stored session: {err}");
                    None
                }
            })
            .unwrap_or_default();

        Client {
            agent: ureq::AgentBuilder::new()
                .user_agent(USER_AGENT)
                .cookie_store(store)
                .build(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn new() -> Client {
        Client::with_session(None)
    }

    fn library_url(&self) -> String {
        format!("{}/my-library", self.base_url)
    }

    fn cart_url(&self) -> String {
        format!("{}/blackstone_custom/ajax/getCartCount", self.base_url)
    }

    fn book_meta_url(&self) -> String {
        format!("{}/my-library/ajax/ajaxGetBookActionOptions", self.base_url)
    }

    fn book_dl_url(&self) -> String {
        format!("{}/my-library/ajax/ajaxDLBookBD", self.base_url)
    }

    /// Serializes the current cookie jar to an opaque blob for storage.
    pub fn session_blob(&self) -> Result<Vec<u8>> {
        let mut blob = Vec::new();
        self.agent
            .cookie_store()
            .save_json(&mut blob)
            .map_err(|err| anyhow!("unable to serialize session cookies: {err}"))?;
        Ok(blob)
    }

    /// Live probe for session validity: an authenticated cart-count request.
    /// Any transport error, bad status, or unexpected body uniformly means
    /// the session is no longer usable; the distinction never matters to a
    /// caller, who re-logs-in either way.
    pub fn is_session_valid(&self) -> bool {
        let response = match self.agent.get(&self.cart_url()).call() {
            Ok(response) => response,
            Err(_) => return false,
        };
        match response.into_string() {
            Ok(body) => cart_response_valid(&body),
            Err(_) => false,
        }
    }

    /// Scripted login against the site's HTML. Every extraction step names
    /// the element it could not locate; no step is retried.
    pub fn login(&self, email: &str, password: &str) -> Result<()> {
        let home = self
            .agent
            .get(&self.base_url)
            .call()
            .context("unable to login: cannot load home page")?
            .into_string()
            .context("unable to login: cannot read home page")?;
        let sign_in_url = sign_in_href(&home)?;

        let login_page = self
            .agent
            .get(&sign_in_url)
            .call()
            .context("unable to login: cannot load sign in page")?
            .into_string()
            .context("unable to login: cannot read sign in page")?;
        let form = login_form(&login_page)?;

        // The guest cookies accumulated above ride along in the agent's jar.
        self.agent
            .post(&form.action)
            .send_form(&[
                ("form_key", &form.form_key),
                ("login[username]", email),
                ("login[password]", password),
                ("send", ""),
            ])
            .context("unable to login: login request failed")?;

        // Confirm against the library landing page rather than trusting
        // whatever the POST redirected to.
        let library = self
            .agent
            .get(&self.library_url())
            .call()
            .context("unable to login: cannot load library page")?
            .into_string()
            .context("unable to login: cannot read library page")?;
        if !is_signed_in(&library) {
            bail!("unable to login: invalid email or password");
        }
        Ok(())
    }

    /// Fetches and scrapes the purchased-library page.
    pub fn fetch_library(&self) -> Result<Vec<Book>> {
        let html = self
            .agent
            .get(&self.library_url())
            .call()
            .context("unable to load library page")?
            .into_string()
            .context("unable to read library page")?;
        Ok(parse_library(&html))
    }

    /// Fetches the download manifest for one book, filtered to the wanted
    /// extension and sorted by part number.
    pub fn book_manifest(&self, book_id: &str, ext: &str) -> Result<Vec<FilePart>> {
        let response = self
            .agent
            .post(&self.book_meta_url())
            .send_form(&[("bookId", book_id)])
            .context("could not retrieve book download manifest")?;
        let json: Value = response
            .into_json()
            .context("could not retrieve book download manifest")?;
        if json["status"].as_bool() != Some(true) {
            bail!("could not retrieve book download manifest");
        }
        parse_manifest(&json["manifest"], ext)
    }

    /// Resolves the single-use signed download URL for one file part.
    pub fn download_url(&self, part: &FilePart) -> Result<String> {
        let response = self
            .agent
            .post(&self.book_dl_url())
            .send_form(&[
                ("bdfile", &part.filename),
                ("niceName", &part.pretty_name),
            ])
            .context("could not retrieve the book download URL")?;
        let json: Value = response
            .into_json()
            .context("could not retrieve the book download URL")?;
        if json["status"].as_bool() != Some(true) {
            bail!("could not retrieve the book download URL");
        }
        json["link"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("could not retrieve the book download URL"))
    }

    /// Streams a signed URL to disk in fixed-size chunks behind a progress
    /// bar sized from the Content-Length header.
    pub fn download_to(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("download failed for {}", dest.display()))?;
        let total = response
            .header("Content-Length")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        let progress = progress!(total).expect("progress");
        let mut reader = response.into_reader();
        let file = File::create(dest)
            .with_context(|| format!("unable to create file {}", dest.display()))?;
        let mut writer = BufWriter::new(file);
        let mut buf = [0u8; DOWNLOAD_CHUNK];

        loop {
            let count = reader
                .read(&mut buf)
                .with_context(|| format!("download interrupted for {}", dest.display()))?;
            if count == 0 {
                break;
            }
            writer
                .write_all(&buf[0..count])
                .with_context(|| format!("unable to write file {}", dest.display()))?;
            progress.inc(count as u64);
        }
        writer
            .flush()
            .with_context(|| format!("unable to write file {}", dest.display()))?;
        progress.finish();
        Ok(())
    }
}

#[derive(Debug)]
struct LoginForm {
    action: String,
    form_key: String,
}

/// True when a cart-count response proves an authenticated session: the
/// body must be JSON carrying a numeric count under `data`.
fn cart_response_valid(body: &str) -> bool {
    match ureq::serde_json::from_str::<Value>(body) {
        Ok(json) => json["data"]["count"].is_number(),
        Err(_) => false,
    }
}

/// Locates the home page's "Sign In" anchor and returns its target.
fn sign_in_href(html: &str) -> Result<String> {
    anchor_href_by_text(html, "Sign In")
        .ok_or_else(|| anyhow!("unable to login: cannot find sign in link"))
}

/// Locates the login form and its CSRF form key.
fn login_form(html: &str) -> Result<LoginForm> {
    let document = Html::parse_document(html);
    let form_selector = Selector::parse("form#login-form").expect("valid selector");
    let key_selector = Selector::parse("input[name=\"form_key\"]").expect("valid selector");

    let form = document
        .select(&form_selector)
        .next()
        .ok_or_else(|| anyhow!("unable to login: cannot find login form"))?;
    let action = form
        .value()
        .attr("action")
        .ok_or_else(|| anyhow!("unable to login: cannot find login form"))?
        .to_string();
    let form_key = form
        .select(&key_selector)
        .next()
        .and_then(|input| input.value().attr("value"))
        .ok_or_else(|| anyhow!("unable to login: cannot find login form key"))?
        .to_string();

    Ok(LoginForm { action, form_key })
}

/// A page proves an authenticated session when it carries a "Signout" link.
fn is_signed_in(html: &str) -> bool {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a").expect("valid selector");
    document
        .select(&selector)
        .any(|anchor| anchor.text().collect::<String>().trim() == "Signout")
}

fn anchor_href_by_text(html: &str, text: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a").expect("valid selector");
    document.select(&selector).find_map(|anchor| {
        if anchor.text().collect::<String>().trim() == text {
            anchor.value().attr("href").map(str::to_string)
        } else {
            None
        }
    })
}

/// Scrapes every library item off the my-library page. A malformed item is
/// skipped with a warning rather than failing the whole page.
pub fn parse_library(html: &str) -> Vec<Book> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("span.product-library-item-link").expect("valid selector");

    let mut books = Vec::new();
    for element in document.select(&selector) {
        match parse_library_item(element) {
            Ok(book) => books.push(book),
            Err(err) => warn!("skipping unparseable library item: {err}"),
        }
    }
    books
}

fn parse_library_item(element: ElementRef) -> Result<Book> {
    let attr = |name: &str| {
        element
            .value()
            .attr(name)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("missing attribute {name}"))
    };

    let runtime_raw = attr("data-runtime")?;
    let runtime = if runtime_raw.is_empty() {
        0.0
    } else {
        runtime_raw
            .parse()
            .with_context(|| format!("bad runtime {runtime_raw:?}"))?
    };

    let img_selector = Selector::parse("img").expect("valid selector");
    let cover = element
        .select(&img_selector)
        .next()
        .and_then(|img| img.value().attr("src"))
        .ok_or_else(|| anyhow!("missing cover image"))?
        .to_string();

    Ok(Book {
        book_id: attr("data-book_id")?,
        item_id: attr("data-itemid")?.parse().context("bad item id")?,
        sku: attr("data-sku")?,
        title: attr("title")?,
        author: attr("data-author-display-string")?,
        drm: attr("data-drm")? == "1",
        is_released: attr("data-is-released")? == "1",
        is_rental: attr("data-is-rental")? == "1",
        purchase_date: parse_datetime(&attr("data-purchase-date")?)?,
        release_date: parse_date(&attr("data-release-date")?)?,
        runtime,
        url: attr("data-href")?,
        cover,
    })
}

/// Filters a download manifest to one extension and orders the surviving
/// entries by their "File N of M" label. An entry without a parseable label
/// fails the whole book; a partial manifest is worse than none.
pub fn parse_manifest(manifest: &Value, ext: &str) -> Result<Vec<FilePart>> {
    let entries = manifest
        .as_object()
        .ok_or_else(|| anyhow!("could not retrieve book download manifest"))?;
    let suffix = format!(".{}", ext.to_ascii_lowercase());
    let part_regex = Regex::new(r"(?i)^File (\d+) of \d+$")?;

    let mut parts = Vec::new();
    for (file_name, entry) in entries {
        if !file_name.to_ascii_lowercase().ends_with(&suffix) {
            continue;
        }

        let label = entry["countOf"].as_str().unwrap_or("");
        let part = part_regex
            .captures(label)
            .and_then(|captures| captures[1].parse().ok())
            .ok_or_else(|| anyhow!("could not parse book download part label {label:?}"))?;

        let field = |name: &str| {
            entry[name]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("manifest entry {file_name} is missing {name}"))
        };
        parts.push(FilePart {
            filename: field("filename")?,
            pretty_name: field("prettyName")?,
            title: field("title")?,
            part,
            ext: field("ext")?,
        });
    }

    parts.sort_by_key(|part| part.part);
    Ok(parts)
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%y %H:%M:%S",
    "%b %d, %Y %I:%M:%S %p",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%b %d, %Y", "%B %d, %Y"];

/// Lenient parse of the ISO-ish datetime strings the site renders.
fn parse_datetime(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(parsed);
        }
    }
    // Date-only values fall back to midnight.
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, format) {
            return parsed
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| anyhow!("bad date {value:?}"));
        }
    }
    bail!("bad date {value:?}")
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    let value = value.trim();
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, format) {
            return Ok(parsed);
        }
    }
    parse_datetime(value).map(|datetime| datetime.date())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ureq::json;

    const LIBRARY_ITEM: &str = r#"
        <html><body>
          <span class="product-library-item-link" title="The Stars My Destination"
                data-book_id="123" data-itemid="456" data-sku="BK123"
                data-author-display-string="Alfred Bester|Neil Gaiman"
                data-drm="0" data-is-released="1" data-is-rental="0"
                data-purchase-date="2021-06-01 14:30:00"
                data-release-date="2020-11-03" data-runtime="{runtime}"
                data-href="https://www.downpour.com/the-stars-my-destination">
            <img src="https://images.downpour.com/covers/123.jpg">
          </span>
        </body></html>"#;

    fn library_html(runtime: &str) -> String {
        LIBRARY_ITEM.replace("{runtime}", runtime)
    }

    #[test]
    fn parses_library_item_attributes() {
        let books = parse_library(&library_html("11.5"));
        assert_eq!(books.len(), 1);
        let book = &books[0];
        assert_eq!(book.book_id, "123");
        assert_eq!(book.item_id, 456);
        assert_eq!(book.sku, "BK123");
        assert_eq!(book.title, "The Stars My Destination");
        assert_eq!(book.author, "Alfred Bester|Neil Gaiman");
        assert!(!book.drm);
        assert!(book.is_released);
        assert!(!book.is_rental);
        assert_eq!(book.runtime, 11.5);
        assert_eq!(book.purchase_date.to_string(), "2021-06-01 14:30:00");
        assert_eq!(book.release_date.to_string(), "2020-11-03");
        assert_eq!(book.cover, "https://images.downpour.com/covers/123.jpg");
    }

    #[test]
    fn empty_runtime_normalizes_to_zero() {
        let books = parse_library(&library_html(""));
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].runtime, 0.0);
    }

    #[test]
    fn malformed_item_is_skipped() {
        let html = r#"<span class="product-library-item-link" title="No Attrs"></span>"#;
        assert!(parse_library(html).is_empty());
    }

    #[test]
    fn cart_probe_accepts_only_numeric_count() {
        assert!(cart_response_valid(r#"{"data": {"count": 3}}"#));
        assert!(cart_response_valid(r#"{"data": {"count": 0}}"#));
        assert!(!cart_response_valid(r#"{"data": {"count": null}}"#));
        assert!(!cart_response_valid(r#"{"data": {}}"#));
        assert!(!cart_response_valid(r#"{"data": "nope"}"#));
        assert!(!cart_response_valid("<html>guest</html>"));
        assert!(!cart_response_valid(""));
    }

    #[test]
    fn sign_in_link_extraction() {
        let html = r#"<a href="/account">My Account</a>
                      <a href="https://www.downpour.com/customer/account/login">Sign In</a>"#;
        assert_eq!(
            sign_in_href(html).unwrap(),
            "https://www.downpour.com/customer/account/login"
        );

        let err = sign_in_href("<a href='/x'>Register</a>").unwrap_err();
        assert_eq!(err.to_string(), "unable to login: cannot find sign in link");
    }

    #[test]
    fn login_form_extraction() {
        let html = r#"
            <form id="login-form" action="https://www.downpour.com/customer/account/loginPost/">
              <input name="form_key" type="hidden" value="abc123">
              <input name="login[username]" type="text">
            </form>"#;
        let form = login_form(html).unwrap();
        assert_eq!(form.action, "https://www.downpour.com/customer/account/loginPost/");
        assert_eq!(form.form_key, "abc123");
    }

    #[test]
    fn login_form_failures_name_the_missing_element() {
        let err = login_form("<form id='other'></form>").unwrap_err();
        assert_eq!(err.to_string(), "unable to login: cannot find login form");

        let err = login_form("<form id='login-form' action='/post'></form>").unwrap_err();
        assert_eq!(err.to_string(), "unable to login: cannot find login form key");
    }

    #[test]
    fn signed_in_marker() {
        assert!(is_signed_in(r#"<a href="/customer/account/logout">Signout</a>"#));
        assert!(!is_signed_in(r#"<a href="/login">Sign In</a>"#));
    }

    #[test]
    fn manifest_sorted_by_part_regardless_of_map_order() {
        let manifest = json!({
            "book.m4b": {
                "countOf": "File 2 of 3", "filename": "bk_2.m4b",
                "prettyName": "Book Part 2", "title": "Book", "ext": "m4b"
            },
            "book2.m4b": {
                "countOf": "File 1 of 3", "filename": "bk_1.m4b",
                "prettyName": "Book Part 1", "title": "Book", "ext": "m4b"
            },
            "book.zip": {
                "countOf": "File 3 of 3", "filename": "bk.zip",
                "prettyName": "Book Zip", "title": "Book", "ext": "zip"
            }
        });
        let parts = parse_manifest(&manifest, "m4b").unwrap();
        assert_eq!(parts.iter().map(|p| p.part).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(parts[0].filename, "bk_1.m4b");
    }

    #[test]
    fn manifest_extension_filter_is_case_insensitive() {
        let manifest = json!({
            "BOOK.M4B": {
                "countOf": "file 1 of 1", "filename": "bk.m4b",
                "prettyName": "Book", "title": "Book", "ext": "m4b"
            }
        });
        let parts = parse_manifest(&manifest, "m4b").unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part, 1);
    }

    #[test]
    fn unparseable_part_label_is_fatal() {
        let manifest = json!({
            "book.m4b": {
                "countOf": "Unknown", "filename": "bk.m4b",
                "prettyName": "Book", "title": "Book", "ext": "m4b"
            }
        });
        assert!(parse_manifest(&manifest, "m4b").is_err());
    }

    #[test]
    fn manifest_must_be_an_object() {
        assert!(parse_manifest(&json!(null), "m4b").is_err());
        assert!(parse_manifest(&json!([1, 2]), "m4b").is_err());
    }

    #[test]
    fn lenient_date_parsing() {
        assert_eq!(
            parse_datetime("2021-06-01 14:30:00").unwrap().to_string(),
            "2021-06-01 14:30:00"
        );
        assert_eq!(
            parse_datetime("6/1/2021 14:30:00").unwrap().to_string(),
            "2021-06-01 14:30:00"
        );
        // Date-only purchase dates fall back to midnight.
        assert_eq!(
            parse_datetime("2021-06-01").unwrap().to_string(),
            "2021-06-01 00:00:00"
        );
        assert_eq!(parse_date("11/3/2020").unwrap().to_string(), "2020-11-03");
        assert_eq!(
            parse_date("2020-11-03 10:00:00").unwrap().to_string(),
            "2020-11-03"
        );
        assert!(parse_datetime("whenever").is_err());
        assert!(parse_date("").is_err());
    }
}
