// Rate-limited snapshot fetching from the timetable API.
//
// Endpoints (relative to the configured API root):
// - Plan:   /plan/{eva}/{YYMMDD}/{HH}
// - Change: /fchg/{eva}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{NaiveDateTime, Timelike};
use quick_xml::encoding::Decoder;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use reqwest::blocking;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};

use crate::config::{ApiCredentials, Config};
use crate::error::{Error, Result};
use crate::rate_limiter::RateLimiter;
use crate::scheduler;
use crate::snapshot::{SnapshotKind, SnapshotStore};
use crate::stations;

const REQUEST_TIMEOUT_SECS: u64 = 10;
const PLAN_HOURS_AHEAD: u32 = 6;

// ============================================================================
// Transport
// ============================================================================

pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> Result<Bytes>;
}

pub struct HttpTransport {
    client: blocking::Client,
}

impl HttpTransport {
    pub fn new(credentials: &ApiCredentials) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("db-api-key", header_value(&credentials.api_key)?);
        headers.insert("db-client-id", header_value(&credentials.client_id)?);
        headers.insert(ACCEPT, HeaderValue::from_static("application/xml"));

        let client = blocking::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpTransport { client })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Config(format!("Invalid API header value: {}", e)))
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::Network(format!("Request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        response
            .bytes()
            .map_err(|e| Error::Network(format!("Failed to read response from {}: {}", url, e)))
    }
}

// ============================================================================
// XML Canonicalisation
// ============================================================================

/// Re-serialises an XML document as UTF-8 with a fixed declaration, double-quoted
/// attributes, resolved character references and trimmed text. Comments and
/// processing instructions are dropped, so equal content always yields equal bytes.
pub fn canonicalize_xml(raw: &[u8], pretty: bool) -> Result<Vec<u8>> {
    let mut reader = Reader::from_reader(raw);
    reader.config_mut().trim_text(true);
    let mut writer = if pretty {
        Writer::new_with_indent(Vec::new(), b' ', 2)
    } else {
        Writer::new(Vec::new())
    };
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| malformed(&e))?;

    let mut depth = 0usize;
    let mut saw_root = false;
    loop {
        let event = reader.read_event().map_err(|e| malformed(&e))?;
        // The declaration may switch the decoder, so fetch it per event.
        let decoder = reader.decoder();
        let output = match event {
            Event::Eof => break,
            Event::Decl(_) | Event::DocType(_) | Event::Comment(_) | Event::PI(_) => continue,
            Event::Start(_) | Event::Empty(_) if depth == 0 && saw_root => {
                return Err(malformed(&"more than one root element"));
            }
            Event::Start(start) => {
                depth += 1;
                saw_root = true;
                Event::Start(rebuild_start(decoder, &start)?)
            }
            Event::Empty(start) => {
                saw_root = true;
                Event::Empty(rebuild_start(decoder, &start)?)
            }
            Event::End(end) => {
                depth = depth.saturating_sub(1);
                Event::End(BytesEnd::new(decode(decoder, end.name().as_ref())?))
            }
            Event::Text(_) | Event::CData(_) if depth == 0 => {
                return Err(malformed(&"text outside the root element"));
            }
            Event::Text(text) => {
                let text = decode_escaped(decoder, &text)?;
                writer
                    .write_event(Event::Text(BytesText::new(&text)))
                    .map_err(|e| malformed(&e))?;
                continue;
            }
            Event::CData(data) => Event::CData(BytesCData::new(decode(decoder, &data)?)),
        };
        writer.write_event(output).map_err(|e| malformed(&e))?;
    }

    if !saw_root || depth != 0 {
        return Err(malformed(&"document is empty or not closed"));
    }
    Ok(writer.into_inner())
}

fn malformed(e: &dyn std::fmt::Display) -> Error {
    Error::Parse(format!("Malformed XML response: {}", e))
}

fn decode(decoder: Decoder, raw: &[u8]) -> Result<String> {
    decoder
        .decode(raw)
        .map(|text| text.into_owned())
        .map_err(|e| malformed(&e))
}

/// Decodes raw markup content and resolves entity and character references.
fn decode_escaped(decoder: Decoder, raw: &[u8]) -> Result<String> {
    let decoded = decoder.decode(raw).map_err(|e| malformed(&e))?;
    let text = unescape(&decoded).map_err(|e| malformed(&e))?;
    Ok(text.into_owned())
}

fn rebuild_start(decoder: Decoder, start: &BytesStart) -> Result<BytesStart<'static>> {
    let mut rebuilt = BytesStart::new(decode(decoder, start.name().as_ref())?);
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| malformed(&e))?;
        let key = decode(decoder, attribute.key.as_ref())?;
        let value = decode_escaped(decoder, &attribute.value)?;
        rebuilt.push_attribute((key.as_str(), value.as_str()));
    }
    Ok(rebuilt)
}

// ============================================================================
// Fetcher
// ============================================================================

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub prettify: bool,
    pub skip_if_exists: bool,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            prettify: true,
            skip_if_exists: false,
            max_attempts: 4,
            retry_delay: Duration::from_secs(1),
        }
    }
}

pub struct Fetcher<T: Transport> {
    transport: T,
    limiter: Arc<RateLimiter>,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T, limiter: Arc<RateLimiter>) -> Self {
        Fetcher { transport, limiter }
    }

    /// Fetches `url` into `destination`, one rate-limit token per attempt.
    ///
    /// Never fails loudly: exhausted retries are logged and reported as `false`,
    /// and no file is written.
    pub fn acquire_and_fetch(&self, url: &str, destination: &Path, options: &FetchOptions) -> bool {
        if options.skip_if_exists && destination.exists() {
            tracing::info!("SKIPPED (exists): {:?}", destination);
            return true;
        }

        let attempts = options.max_attempts.max(1);
        for attempt in 1..=attempts {
            self.limiter.acquire();

            match self.fetch_once(url, destination, options.prettify) {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!("Success after {} attempts: {}", attempt, url);
                    } else {
                        tracing::debug!("Fetched {}", url);
                    }
                    return true;
                }
                Err(e) => {
                    tracing::warn!("Attempt {}/{} failed for {}: {}", attempt, attempts, url, e);
                    if attempt < attempts {
                        self.limiter.clock().sleep(options.retry_delay);
                    }
                }
            }
        }

        tracing::error!("Failed to fetch data after {} attempts: {}", attempts, url);
        false
    }

    fn fetch_once(&self, url: &str, destination: &Path, prettify: bool) -> Result<()> {
        let body = self.transport.get(url)?;
        let xml = canonicalize_xml(&body, prettify)?;
        fs::write(destination, xml)?;
        Ok(())
    }
}

// ============================================================================
// Fetch Cycle
// ============================================================================

/// Outcome counters of one fetch cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub succeeded: usize,
    pub failed: usize,
}

impl CycleStats {
    fn count(&mut self, ok: bool) {
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Fetches the change snapshot of every station, then the plan snapshots for
/// the current hour and the following five hours. Failures never stop the cycle.
pub fn fetch_cycle<T: Transport>(
    fetcher: &Fetcher<T>,
    snapshots: &SnapshotStore,
    api_base_url: &str,
    evas: &[String],
    now: NaiveDateTime,
) -> Result<(PathBuf, CycleStats)> {
    let date = now.date();
    let folder = snapshots.date_folder(date);
    fs::create_dir_all(&folder)?;

    let current_hour = now.hour();
    let url_date = date.format("%y%m%d").to_string();
    let mut stats = CycleStats::default();

    let change_options = FetchOptions {
        prettify: false,
        ..FetchOptions::default()
    };
    for eva in evas {
        let url = format!("{}/fchg/{}", api_base_url, eva);
        let destination = snapshots.snapshot_path(date, eva, SnapshotKind::Change, current_hour);
        stats.count(fetcher.acquire_and_fetch(&url, &destination, &change_options));
    }

    let plan_options = FetchOptions {
        skip_if_exists: true,
        ..FetchOptions::default()
    };
    for eva in evas {
        for offset in 0..PLAN_HOURS_AHEAD {
            let hour = (current_hour + offset) % 24;
            let url = format!("{}/plan/{}/{}/{:02}", api_base_url, eva, url_date, hour);
            let destination = snapshots.snapshot_path(date, eva, SnapshotKind::Plan, hour);
            stats.count(fetcher.acquire_and_fetch(&url, &destination, &plan_options));
        }
    }

    Ok((folder, stats))
}

/// Entry point used by the CLI, the scheduler and the manual trigger.
pub fn run_fetch_cycle(config: &Config, limiter: Arc<RateLimiter>) -> Result<PathBuf> {
    let transport = HttpTransport::new(config.require_credentials()?)?;
    let fetcher = Fetcher::new(transport, limiter);
    let snapshots = SnapshotStore::new(&config.snapshot_dir);
    let evas = stations::load_eva_list(&config.eva_list_path())?;

    tracing::info!("Fetching snapshots for {} stations", evas.len());
    let (folder, stats) = fetch_cycle(&fetcher, &snapshots, &config.api_base_url, &evas, scheduler::local_now())?;
    tracing::info!(
        "Fetch cycle done: {} saved, {} failed, folder {:?}",
        stats.succeeded,
        stats.failed,
        folder
    );
    Ok(folder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::tests::FakeClock;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    const BODY: &str = "<?xml version='1.0' encoding='utf-8'?>\n<timetable station=\"A\">\n  <s id=\"1-1\"/>\n</timetable>\n";

    /// Replays queued responses, then repeats `fallback`.
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<Bytes>>>,
        fallback: Option<&'static str>,
        requested: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<Bytes>>, fallback: Option<&'static str>) -> Self {
            ScriptedTransport {
                responses: Mutex::new(responses.into()),
                fallback,
                requested: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().expect("lock").clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn get(&self, url: &str) -> Result<Bytes> {
            self.requested.lock().expect("lock").push(url.to_string());
            if let Some(response) = self.responses.lock().expect("lock").pop_front() {
                return response;
            }
            match self.fallback {
                Some(body) => Ok(Bytes::from_static(body.as_bytes())),
                None => Err(Error::Network("connection refused".to_string())),
            }
        }
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}_{}", prefix, std::process::id(), nanos))
    }

    fn fetcher(transport: ScriptedTransport) -> (Fetcher<ScriptedTransport>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new());
        let limiter = Arc::new(RateLimiter::with_clock(50, Duration::from_secs(60), clock.clone()));
        (Fetcher::new(transport, limiter), clock)
    }

    fn server_error() -> Result<Bytes> {
        Err(Error::Http {
            status: 500,
            url: "https://api.example.com/data".to_string(),
        })
    }

    #[test]
    fn canonical_xml_is_stable_across_formatting() {
        let compact = canonicalize_xml(BODY.as_bytes(), false).expect("canonical");
        assert_eq!(
            String::from_utf8(compact.clone()).expect("utf8"),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><timetable station=\"A\"><s id=\"1-1\"/></timetable>"
        );

        let reformatted = "<timetable station=\"A\"><s id=\"1-1\"/>\n\n</timetable>";
        assert_eq!(canonicalize_xml(reformatted.as_bytes(), false).expect("canonical"), compact);

        let pretty = String::from_utf8(canonicalize_xml(BODY.as_bytes(), true).expect("pretty")).expect("utf8");
        assert!(pretty.contains("<s id=\"1-1\"/>"));
        assert!(pretty.lines().count() > 1);
    }

    #[test]
    fn canonical_xml_rejects_non_documents() {
        assert!(canonicalize_xml(b"Error", false).is_err());
        assert!(canonicalize_xml(b"", false).is_err());
        assert!(canonicalize_xml(b"<timetable><s>", false).is_err());
        assert!(canonicalize_xml(b"<a/><b/>", false).is_err());
    }

    #[test]
    fn canonical_xml_reencodes_latin1_as_utf8() {
        let latin1: &[u8] =
            b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><timetable station=\"K\xF6ln Hbf\"><s id=\"1-1\"/></timetable>";

        let output = String::from_utf8(canonicalize_xml(latin1, false).expect("canonical")).expect("utf8 output");

        assert_eq!(
            output,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><timetable station=\"Köln Hbf\"><s id=\"1-1\"/></timetable>"
        );
    }

    #[test]
    fn canonical_xml_normalises_quotes_and_references() {
        let referenced = "<timetable station='K&#246;ln Hbf'><!-- note --><s id=\"1-1\"><dp ppth='A &amp; B'/></s></timetable>";
        let literal = "<timetable station=\"Köln Hbf\"><s id=\"1-1\"><dp ppth=\"A &amp; B\"/></s></timetable>";

        let left = canonicalize_xml(referenced.as_bytes(), false).expect("canonical");
        let right = canonicalize_xml(literal.as_bytes(), false).expect("canonical");

        assert_eq!(left, right);
        let output = String::from_utf8(left).expect("utf8");
        assert!(output.contains("station=\"Köln Hbf\""));
        assert!(output.contains("ppth=\"A &amp; B\""));
        assert!(!output.contains("note"));
    }

    #[test]
    fn latin1_snapshot_is_readable_by_the_parser() {
        let dir = temp_dir("fetch_latin1");
        fs::create_dir_all(&dir).expect("create dir");
        let destination = dir.join("8000207_plan_10.xml");
        let body: &'static [u8] = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\
            <timetable station=\"K\xF6ln Hbf\"><s id=\"r-1\"><tl c=\"ICE\" n=\"5\"/><dp pt=\"2401011000\"/></s></timetable>";
        let transport = ScriptedTransport::new(vec![Ok(Bytes::from_static(body))], None);
        let (fetcher, _clock) = fetcher(transport);

        assert!(fetcher.acquire_and_fetch("https://api.example.com/data", &destination, &FetchOptions::default()));

        let rows = crate::parser::parse_plan_snapshot(&destination, &Default::default()).expect("plan");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].station, "Köln Hbf");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn writes_canonical_snapshot_on_success() {
        let dir = temp_dir("fetch_ok");
        fs::create_dir_all(&dir).expect("create dir");
        let destination = dir.join("8000105_fchg_10.xml");
        let (fetcher, clock) = fetcher(ScriptedTransport::new(vec![], Some(BODY)));

        let options = FetchOptions {
            prettify: false,
            ..FetchOptions::default()
        };
        assert!(fetcher.acquire_and_fetch("https://api.example.com/data", &destination, &options));

        let written = fs::read_to_string(&destination).expect("snapshot");
        assert!(written.contains("<s id=\"1-1\"/>"));
        assert_eq!(clock.elapsed(), Duration::ZERO);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn retries_after_failure_with_fixed_delay() {
        let dir = temp_dir("fetch_retry");
        fs::create_dir_all(&dir).expect("create dir");
        let destination = dir.join("snapshot.xml");
        let transport = ScriptedTransport::new(vec![server_error()], Some(BODY));
        let (fetcher, clock) = fetcher(transport);

        let options = FetchOptions {
            max_attempts: 2,
            ..FetchOptions::default()
        };
        assert!(fetcher.acquire_and_fetch("https://api.example.com/data", &destination, &options));

        assert!(destination.exists());
        assert_eq!(fetcher.transport.requested().len(), 2);
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
        assert!(fetcher.limiter.available() < 49.0);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn malformed_body_counts_as_failed_attempt() {
        let dir = temp_dir("fetch_malformed");
        fs::create_dir_all(&dir).expect("create dir");
        let destination = dir.join("snapshot.xml");
        let transport = ScriptedTransport::new(vec![Ok(Bytes::from_static(b"<html>"))], Some(BODY));
        let (fetcher, _clock) = fetcher(transport);

        assert!(fetcher.acquire_and_fetch("https://api.example.com/data", &destination, &FetchOptions::default()));
        assert_eq!(fetcher.transport.requested().len(), 2);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn gives_up_after_max_attempts_without_writing() {
        let dir = temp_dir("fetch_fail");
        fs::create_dir_all(&dir).expect("create dir");
        let destination = dir.join("snapshot.xml");
        let (fetcher, clock) = fetcher(ScriptedTransport::new(vec![], None));

        assert!(!fetcher.acquire_and_fetch("https://api.example.com/data", &destination, &FetchOptions::default()));

        assert!(!destination.exists());
        assert_eq!(fetcher.transport.requested().len(), 4);
        assert_eq!(clock.elapsed(), Duration::from_secs(3));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn skips_existing_destination() {
        let dir = temp_dir("fetch_skip");
        fs::create_dir_all(&dir).expect("create dir");
        let destination = dir.join("snapshot.xml");
        fs::write(&destination, "<timetable/>").expect("write");
        let (fetcher, _clock) = fetcher(ScriptedTransport::new(vec![], Some(BODY)));

        let options = FetchOptions {
            skip_if_exists: true,
            ..FetchOptions::default()
        };
        assert!(fetcher.acquire_and_fetch("https://api.example.com/data", &destination, &options));

        assert!(fetcher.transport.requested().is_empty());
        assert_eq!(fs::read_to_string(&destination).expect("snapshot"), "<timetable/>");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cycle_fetches_changes_then_six_plan_hours() {
        let root = temp_dir("fetch_cycle");
        let snapshots = SnapshotStore::new(&root);
        let (fetcher, _clock) = fetcher(ScriptedTransport::new(vec![], Some(BODY)));
        let now = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(21, 40, 0))
            .expect("datetime");
        let evas = vec!["8000105".to_string()];

        let (folder, stats) = fetch_cycle(&fetcher, &snapshots, "https://api.example.com/v1", &evas, now)
            .expect("cycle");

        assert_eq!(folder, root.join("2024-01-01"));
        assert_eq!(stats, CycleStats { succeeded: 7, failed: 0 });
        let requested = fetcher.transport.requested();
        assert_eq!(requested[0], "https://api.example.com/v1/fchg/8000105");
        assert_eq!(requested[1], "https://api.example.com/v1/plan/8000105/240101/21");
        assert_eq!(requested[6], "https://api.example.com/v1/plan/8000105/240101/02");
        assert!(folder.join("8000105_fchg_21.xml").exists());
        assert!(folder.join("8000105_plan_02.xml").exists());

        // Second run in the same hour refreshes the change snapshot only.
        fetch_cycle(&fetcher, &snapshots, "https://api.example.com/v1", &evas, now).expect("cycle");
        assert_eq!(fetcher.transport.requested().len(), 8);

        fs::remove_dir_all(&root).ok();
    }
}
