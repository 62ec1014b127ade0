//! Step-recording test reports shared by pc-proxy unit and integration tests.
//!
//! Every assertion goes through a [`TestReport`], which keeps the ordered list of
//! setup/action/assert steps. When `TEST_REPORT_DIR` is set, the report is written
//! as a plain-text file on drop so a run can be reviewed step by step.

use std::fmt::{Debug, Display};
use std::path::PathBuf;
use std::sync::Mutex;

/// Create a [`TestReport`] named after the enclosing test function.
/// Works for both sync and async test functions.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = &name[..name.len() - 3];
        // async tests are wrapped in a closure
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        $crate::TestReport::new(name, $title, file!(), line!())
    }};
}

enum Step {
    Setup(String),
    Action(String),
    Pass(String),
    Fail(String),
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Setup(msg) => write!(f, "STEP setup: {}", msg),
            Step::Action(msg) => write!(f, "STEP action: {}", msg),
            Step::Pass(msg) => write!(f, "STEP assert_pass: {}", msg),
            Step::Fail(msg) => write!(f, "STEP assert_fail: {}", msg),
        }
    }
}

pub struct TestReport {
    full_path: String,
    title: String,
    steps: Mutex<Vec<Step>>,
    report_dir: Option<PathBuf>,
    source: String,
}

impl TestReport {
    pub fn new(full_path: &str, title: &str, source_file: &str, source_line: u32) -> Self {
        Self {
            full_path: full_path.to_string(),
            title: title.to_string(),
            steps: Mutex::new(Vec::new()),
            report_dir: std::env::var("TEST_REPORT_DIR").ok().map(PathBuf::from),
            source: format!("{}:{}", source_file, source_line),
        }
    }

    fn push(&self, step: Step) {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(step);
    }

    /// Debug-format a value for the report, truncated so huge bodies stay readable.
    fn shown(value: &impl Debug) -> String {
        let s = format!("{:?}", value);
        if s.len() <= 500 {
            format!("`{}`", s)
        } else {
            let mut end = 500;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("`{}…` ({} bytes)", &s[..end], s.len())
        }
    }

    pub fn setup(&self, msg: impl Display) {
        self.push(Step::Setup(msg.to_string()));
    }

    pub fn action(&self, msg: impl Display) {
        self.push(Step::Action(msg.to_string()));
    }

    fn record(&self, pass: bool, msg: String) {
        self.push(if pass { Step::Pass(msg) } else { Step::Fail(msg) });
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        let pass = actual == expected;
        self.record(
            pass,
            format!("{}: {} == {}", label, Self::shown(actual), Self::shown(expected)),
        );
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.record(value, format!("{}: `{}`", label, value));
        assert!(value, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let pass = haystack.contains(needle);
        self.record(
            pass,
            format!(
                "{}: {} contains {}",
                label,
                Self::shown(&haystack),
                Self::shown(&needle)
            ),
        );
        assert!(pass, "{}: {:?} does not contain {:?}", label, haystack, needle);
    }

    fn group(&self) -> &str {
        let mut parts = self.full_path.rsplit("::");
        parts.next();
        parts.next().unwrap_or(&self.full_path)
    }

    fn name(&self) -> &str {
        self.full_path.rsplit("::").next().unwrap_or(&self.full_path)
    }

    fn write_report(&self) {
        let Some(dir) = &self.report_dir else {
            return;
        };

        let result = if std::thread::panicking() {
            "fail"
        } else {
            "pass"
        };

        let mut lines = vec![
            format!("GROUP: {}", self.group()),
            format!("NAME: {}", self.name()),
            format!("TITLE: {}", self.title),
            format!("SOURCE: {}", self.source),
        ];
        let steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        lines.extend(steps.iter().map(|s| s.to_string()));
        lines.push(format!("RESULT: {}", result));
        lines.push(String::new());

        let path = dir.join(format!("{}.txt", self.full_path.replace("::", "__")));
        let _ = std::fs::create_dir_all(dir);
        let _ = std::fs::write(path, lines.join("\n"));
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write_report();
    }
}
