use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;
use ubp::{
    build_feature_table, build_feature_table_with_encoder, clean_raw, log_app_finish,
    log_app_start, log_vocabulary_selected, read_raw_csv, CountryEncoder, FeatureTableConfig,
    LoggingConfig, Transaction, UnseenCategoryPolicy,
};

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn sample_tx(customer: &str, country: &str) -> Transaction {
    Transaction {
        invoice_id: format!("INV-{customer}"),
        stock_code: "85123A".to_string(),
        customer_id: customer.to_string(),
        quantity: 2,
        unit_price: 2.55,
        invoice_timestamp: NaiveDate::from_ymd_opt(2011, 5, 2)
            .expect("valid date")
            .and_hms_opt(11, 30, 0)
            .expect("valid time"),
        country: country.to_string(),
    }
}

#[test]
fn table_build_emits_start_and_finish_events() {
    let logs = capture_logs(Level::INFO, || {
        let log = vec![sample_tx("1", "UK"), sample_tx("2", "France")];
        build_feature_table(&log, &FeatureTableConfig::default()).expect("table builds");
    });

    assert!(logs.contains("\"event\":\"features.table.start\""), "{logs}");
    assert!(logs.contains("\"event\":\"features.table.finish\""), "{logs}");
    assert!(logs.contains("\"customers\":2"), "{logs}");
    assert!(!logs.contains("features.calculators.done"), "{logs}");
}

#[test]
fn debug_level_includes_calculator_summary() {
    let logs = capture_logs(Level::DEBUG, || {
        build_feature_table(&[sample_tx("1", "UK")], &FeatureTableConfig::default())
            .expect("table builds");
    });

    assert!(logs.contains("\"event\":\"features.calculators.done\""), "{logs}");
}

#[test]
fn unseen_country_under_pinned_vocabulary_is_warned() {
    let encoder = CountryEncoder::fit(["UK"], UnseenCategoryPolicy::AllZero);
    let logs = capture_logs(Level::WARN, || {
        let log = vec![sample_tx("1", "UK"), sample_tx("2", "Japan")];
        build_feature_table_with_encoder(&log, &FeatureTableConfig::default(), &encoder)
            .expect("table builds");
    });

    assert!(
        logs.contains("\"event\":\"features.encoder.unseen_category\""),
        "{logs}"
    );
    assert!(logs.contains("Japan"), "{logs}");
    assert!(!logs.contains("features.table.finish"), "{logs}");
}

#[test]
fn cleaning_reports_drop_counts() {
    let csv = "\
Invoice,StockCode,CustomerID,Quantity,Price,InvoiceDate,Country
1,A,7,1,1.0,2011-01-01 10:00:00,UK
C2,A,7,-1,1.0,2011-01-02 10:00:00,UK
";
    let logs = capture_logs(Level::INFO, || {
        let raw = read_raw_csv(csv.as_bytes()).expect("csv parses");
        clean_raw(raw);
    });

    assert!(
        logs.contains("\"event\":\"transactions.clean.finish\""),
        "{logs}"
    );
    assert!(logs.contains("\"dropped_non_positive_quantity\":1"), "{logs}");
}

#[test]
fn app_lifecycle_events_are_structured() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start(
            &LoggingConfig::default(),
            Path::new("data/clean.csv"),
            Path::new("out/features.csv"),
        );
        log_vocabulary_selected("pin", Some(Path::new("vocab/countries.json")));
        log_app_finish(42, "abc123");
    });

    assert!(logs.contains("\"event\":\"app.start\""), "{logs}");
    assert!(logs.contains("\"input\":\"data/clean.csv\""), "{logs}");
    assert!(logs.contains("\"event\":\"vocabulary.selected\""), "{logs}");
    assert!(logs.contains("\"mode\":\"pin\""), "{logs}");
    assert!(logs.contains("\"event\":\"app.finish\""), "{logs}");
    assert!(logs.contains("\"customers\":42"), "{logs}");
}
