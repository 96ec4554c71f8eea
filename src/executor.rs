//! Runs analysis snippets (Rhai scripts) against the session's tables.
//!
//! The namespace handed to a snippet holds `df_all`, `dfs`, one `df_<stem>`
//! per dataset, `df` when exactly one dataset is registered, the `px`
//! plotting module and the `show` display helper.
//!
//! Imports are checked against a fixed module denylist and `eval` is
//! disabled. This is a usage policy, not isolation: the script shares the
//! host process and can still burn CPU up to the operation ceiling.

use crate::cell::Value;
use crate::graph::{Figure, GraphType};
use crate::table::{Registry, Table};
use crate::views;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use rhai::{
    Array, Dynamic, Engine, EvalAltResult, Map, Module, ModuleResolver, Position, Scope, Shared,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Modules a snippet may never import (matched on the name before the
/// first `.` or `/`).
pub const BLOCKED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "pathlib",
    "importlib",
    "inspect",
    "builtins",
    "pkg_resources",
];

/// Builtins removed from the engine.
pub const BLOCKED_SYMBOLS: &[&str] = &["eval"];

/// Name a snippet binds a chart to for HTML export.
pub const FIGURE_VARIABLE: &str = "fig";

lazy_static! {
    static ref SCRIPT_IMPORT: Regex = Regex::new(r#"\bimport\s+["`]([^"`]+)["`]"#).unwrap();
    static ref PLAIN_IMPORT: Regex =
        Regex::new(r"(?m)^\s*import\s+([A-Za-z_][A-Za-z0-9_.]*)").unwrap();
    static ref FROM_IMPORT: Regex =
        Regex::new(r"(?m)^\s*from\s+([A-Za-z_][A-Za-z0-9_.]*)\s+import\b").unwrap();
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Ceiling on script operations; 0 disables the ceiling.
    pub max_operations: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_operations: 50_000_000,
        }
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed {
        message: String,
        line: Option<usize>,
    },
    Denied {
        module: String,
    },
}

/// Something a snippet passed to `show(...)`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shown {
    Text { text: String },
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        total_rows: usize,
    },
    Figure { figure: Figure },
}

/// Result of one snippet run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunReport {
    pub outcome: Outcome,
    pub output: Vec<String>,
    pub shown: Vec<Shown>,
    pub hint: String,
    /// Chart bound to `fig` when the run finished, offered as HTML export.
    pub figure: Option<Figure>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}

/// Rows of a table included in a `show(...)` display.
const SHOW_ROWS: usize = 50;

/// The blocked base module for an import path, if any.
pub fn blocked_base(path: &str) -> Option<&'static str> {
    let base = path
        .trim()
        .split(['.', '/'])
        .next()
        .unwrap_or_default();
    BLOCKED_MODULES.iter().copied().find(|m| *m == base)
}

/// First denylisted import written literally in the source, whether or not
/// the code path containing it would ever run. Comments and string literals
/// other than import paths are not scanned.
pub fn find_blocked_import(source: &str) -> Option<String> {
    let code = code_only(source);
    [&*SCRIPT_IMPORT, &*PLAIN_IMPORT, &*FROM_IMPORT]
        .iter()
        .flat_map(|re| re.captures_iter(&code))
        .filter_map(|cap| cap.get(1))
        .find_map(|m| blocked_base(m.as_str()))
        .map(|m| m.to_string())
}

/// The source with comments removed and string literals emptied, except
/// for the literal directly following an `import` keyword. Line breaks are
/// kept so line-anchored patterns still line up.
fn code_only(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut depth = 1;
                while depth > 0 {
                    match chars.next() {
                        Some('*') if chars.peek() == Some(&'/') => {
                            chars.next();
                            depth -= 1;
                        }
                        Some('/') if chars.peek() == Some(&'*') => {
                            chars.next();
                            depth += 1;
                        }
                        Some('\n') => out.push('\n'),
                        Some(_) => {}
                        None => break,
                    }
                }
                out.push(' ');
            }
            '"' | '`' => {
                let keep = follows_import(&out);
                out.push(c);
                while let Some(next) = chars.next() {
                    if next == '\\' && c == '"' {
                        let escaped = chars.next();
                        if keep {
                            out.push(next);
                            out.extend(escaped);
                        }
                        continue;
                    }
                    if next == c {
                        break;
                    }
                    if keep {
                        out.push(next);
                    } else if next == '\n' {
                        out.push('\n');
                    }
                }
                out.push(c);
            }
            '\'' => {
                while let Some(next) = chars.next() {
                    if next == '\\' {
                        chars.next();
                    } else if next == '\'' {
                        break;
                    }
                }
                out.push_str("' '");
            }
            _ => out.push(c),
        }
    }
    out
}

fn follows_import(code: &str) -> bool {
    let code = code.trim_end();
    match code.strip_suffix("import") {
        Some(before) => !before
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_'),
        None => false,
    }
}

/// Resolves `import` statements: blocked names are refused and recorded,
/// everything outside the allow list is not found.
struct DenylistResolver {
    allowed: BTreeMap<String, Shared<Module>>,
    denied: Arc<Mutex<Option<String>>>,
}

impl ModuleResolver for DenylistResolver {
    fn resolve(
        &self,
        _engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        if let Some(module) = blocked_base(path) {
            if let Ok(mut denied) = self.denied.lock() {
                denied.get_or_insert_with(|| module.to_string());
            }
            return Err(EvalAltResult::ErrorRuntime(
                format!("Import of '{}' is blocked in this sandbox.", module).into(),
                pos,
            )
            .into());
        }
        self.allowed
            .get(path)
            .cloned()
            .ok_or_else(|| EvalAltResult::ErrorModuleNotFound(path.to_string(), pos).into())
    }
}

/// Execute a snippet against the registry.
///
/// Never panics on user code: parse errors, runtime errors and exceeded
/// limits come back as `Outcome::Failed`, denylisted imports as
/// `Outcome::Denied`.
pub fn execute(source: &str, registry: &Registry, config: &ExecutorConfig) -> RunReport {
    let hint = views::hint(registry);

    if let Some(module) = find_blocked_import(source) {
        warn!("snippet denied: import of '{}'", module);
        return RunReport {
            outcome: Outcome::Denied { module },
            output: Vec::new(),
            shown: Vec::new(),
            hint,
            figure: None,
        };
    }

    let output = Arc::new(Mutex::new(Vec::new()));
    let shown = Arc::new(Mutex::new(Vec::new()));
    let denied = Arc::new(Mutex::new(None));

    let engine = build_engine(config, output.clone(), shown.clone(), denied.clone());
    let mut scope = build_scope(registry);

    let result = engine.run_with_scope(&mut scope, source);
    drop(engine);

    let denied_module = denied.lock().ok().and_then(|d| d.clone());
    let outcome = match (denied_module, result) {
        (Some(module), _) => {
            warn!("snippet denied at run time: import of '{}'", module);
            Outcome::Denied { module }
        }
        (None, Ok(())) => Outcome::Completed,
        (None, Err(err)) => {
            debug!("snippet failed: {}", err);
            Outcome::Failed {
                message: err.to_string(),
                line: err.position().line(),
            }
        }
    };

    let figure = scope.get_value::<Figure>(FIGURE_VARIABLE);
    let output = output.lock().map(|o| o.clone()).unwrap_or_default();
    let shown = shown.lock().map(|s| s.clone()).unwrap_or_default();

    RunReport {
        outcome,
        output,
        shown,
        hint,
        figure,
    }
}

fn build_scope(registry: &Registry) -> Scope<'static> {
    let mut scope = Scope::new();

    if let Some(all) = views::build_combined(registry) {
        scope.push("df_all", all);
    }

    let mut dfs = Map::new();
    for dataset in registry.iter() {
        dfs.insert(dataset.name.as_str().into(), Dynamic::from(dataset.table.clone()));
    }
    scope.push("dfs", dfs);

    // set_value overwrites, so colliding aliases keep the later dataset
    for (alias, table) in views::aliases(registry) {
        scope.set_value(alias, table);
    }

    if let Some(dataset) = registry.single() {
        scope.push("df", dataset.table.clone());
    }

    scope
}

fn build_engine(
    config: &ExecutorConfig,
    output: Arc<Mutex<Vec<String>>>,
    shown: Arc<Mutex<Vec<Shown>>>,
    denied: Arc<Mutex<Option<String>>>,
) -> Engine {
    let mut engine = Engine::new();

    for symbol in BLOCKED_SYMBOLS {
        engine.disable_symbol(*symbol);
    }
    if config.max_operations > 0 {
        engine.set_max_operations(config.max_operations);
    }

    let plot: Shared<Module> = plot_module().into();
    let mut allowed = BTreeMap::new();
    allowed.insert("px".to_string(), plot.clone());
    engine.set_module_resolver(DenylistResolver { allowed, denied });
    engine.register_static_module("px", plot);

    let print_out = output.clone();
    engine.on_print(move |s| {
        if let Ok(mut out) = print_out.lock() {
            out.push(s.to_string());
        }
    });
    let debug_out = output;
    engine.on_debug(move |s, _source, pos| {
        if let Ok(mut out) = debug_out.lock() {
            out.push(format!("[{}] {}", pos, s));
        }
    });

    engine.register_fn("show", move |value: Dynamic| {
        let item = if value.is::<Table>() {
            let table = value.cast::<Table>();
            Shown::Table {
                columns: table.columns().to_vec(),
                rows: table.head(SHOW_ROWS).rows().to_vec(),
                total_rows: table.height(),
            }
        } else if value.is::<Figure>() {
            Shown::Figure {
                figure: value.cast::<Figure>(),
            }
        } else {
            Shown::Text {
                text: value.to_string(),
            }
        };
        if let Ok(mut list) = shown.lock() {
            list.push(item);
        }
    });

    register_table_api(&mut engine);
    register_figure_api(&mut engine);
    engine
}

fn script_err(message: String) -> Box<EvalAltResult> {
    message.into()
}

pub(crate) fn value_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Int(i) => Dynamic::from(*i),
        Value::Float(f) => Dynamic::from(*f),
        Value::Text(s) => Dynamic::from(s.clone()),
    }
}

pub(crate) fn dynamic_to_value(value: &Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Int(i)
    } else if let Ok(f) = value.as_float() {
        Value::Float(f)
    } else {
        Value::Text(value.to_string())
    }
}

fn values_to_array(values: Vec<Value>) -> Array {
    values.iter().map(value_to_dynamic).collect()
}

fn register_table_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<Table>("DataFrame")
        .register_get("rows", |t: &mut Table| t.height() as i64)
        .register_get("columns", |t: &mut Table| -> Array {
            t.columns().iter().map(|c| Dynamic::from(c.clone())).collect()
        })
        .register_fn("len", |t: &mut Table| t.height() as i64)
        .register_fn("head", |t: &mut Table, n: i64| t.head(n.max(0) as usize))
        .register_fn("head", |t: &mut Table| t.head(5))
        .register_fn("column", |t: &mut Table, name: &str| {
            t.column(name).map(values_to_array).map_err(script_err)
        })
        .register_fn("unique", |t: &mut Table, name: &str| {
            t.unique(name).map(values_to_array).map_err(script_err)
        })
        .register_fn("select", |t: &mut Table, names: Array| {
            let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
            t.select(&names).map_err(script_err)
        })
        .register_fn("filter", |t: &mut Table, name: &str, value: Dynamic| {
            t.filter_eq(name, &dynamic_to_value(&value)).map_err(script_err)
        })
        .register_fn("sort_by", |t: &mut Table, name: &str| {
            t.sort_by(name, false).map_err(script_err)
        })
        .register_fn("sort_by", |t: &mut Table, name: &str, descending: bool| {
            t.sort_by(name, descending).map_err(script_err)
        })
        .register_fn("sum", |t: &mut Table, name: &str| t.sum(name).map_err(script_err))
        .register_fn("mean", |t: &mut Table, name: &str| t.mean(name).map_err(script_err))
        .register_fn("min", |t: &mut Table, name: &str| t.min(name).map_err(script_err))
        .register_fn("max", |t: &mut Table, name: &str| t.max(name).map_err(script_err))
        .register_fn("group_sum", |t: &mut Table, by: &str, name: &str| {
            t.group_sum(by, name).map_err(script_err)
        })
        .register_fn("to_string", |t: &mut Table| t.render(10))
        .register_fn("to_debug", |t: &mut Table| t.render(10));
}

fn register_figure_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<Figure>("Figure")
        .register_get("title", |f: &mut Figure| f.options.title.clone())
        .register_fn("set_title", |f: &mut Figure, title: &str| {
            f.options.title = title.to_string();
        })
        .register_fn("set_labels", |f: &mut Figure, x: &str, y: &str| {
            f.options.x_label = x.to_string();
            f.options.y_label = y.to_string();
        })
        .register_fn("set_size", |f: &mut Figure, width: i64, height: i64| {
            f.options.width = width.clamp(100, 4000) as u32;
            f.options.height = height.clamp(100, 4000) as u32;
        })
        .register_fn("to_string", |f: &mut Figure| {
            format!(
                "Figure({:?}: {} series, {} points)",
                f.options.graph_type,
                f.series.len(),
                f.point_count()
            )
        });
}

// px::line(df, x, y), px::line(df, x, y, color) and the same for bar,
// scatter and area
fn plot_module() -> Module {
    let mut module = Module::new();
    let kinds = [
        ("line", GraphType::Line),
        ("bar", GraphType::Bar),
        ("scatter", GraphType::Scatter),
        ("area", GraphType::Area),
    ];
    for (name, kind) in kinds {
        module.set_native_fn(name, move |t: &mut Table, x: &str, y: &str| {
            Figure::from_table(t, x, y, None, kind).map_err(script_err)
        });
        module.set_native_fn(name, move |t: &mut Table, x: &str, y: &str, color: &str| {
            Figure::from_table(t, x, y, Some(color), kind).map_err(script_err)
        });
    }
    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::from_delimited;

    fn registry() -> Registry {
        let mut reg = Registry::new();
        reg.insert(
            "north.csv",
            from_delimited(b"month,total\n1,10\n2,14\n").unwrap(),
        );
        reg.insert(
            "south-east.csv",
            from_delimited(b"month,total\n1,7\n2,3\n3,9\n").unwrap(),
        );
        reg
    }

    fn run(source: &str) -> RunReport {
        execute(source, &registry(), &ExecutorConfig::default())
    }

    #[test]
    fn namespace_exposes_views() {
        let report = run(r#"
            print(df_all.rows);
            print(dfs["north.csv"].rows);
            print(df_south_east.sum("total"));
            print(df_all.columns);
        "#);
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.output[0], "5");
        assert_eq!(report.output[1], "2");
        assert_eq!(report.output[2], "19.0");
        assert!(report.output[3].contains("__source__"));
    }

    #[test]
    fn single_dataset_gets_df_alias() {
        let mut reg = Registry::new();
        reg.insert("only.csv", from_delimited(b"a\n1\n2\n").unwrap());
        let report = execute("print(df.len());", &reg, &ExecutorConfig::default());
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.output, vec!["2".to_string()]);

        let report = run("print(df.len());");
        assert!(matches!(report.outcome, Outcome::Failed { .. }));
    }

    #[test]
    fn denylisted_imports_are_denied_wherever_they_appear() {
        let snippets = [
            r#"import "os" as os;"#,
            r#"let x = 1; if x > 5 { import "subprocess" as sp; }"#,
            r#"try { import "sys" as s; } catch { print("caught"); }"#,
            r#"let broken = ; import "socket" as net;"#,
            "import os\nprint(os.listdir())",
            "from shutil import rmtree",
            r#"import "os.path" as p;"#,
        ];
        for snippet in snippets {
            let report = run(snippet);
            assert!(
                matches!(report.outcome, Outcome::Denied { .. }),
                "expected denial for {:?}, got {:?}",
                snippet,
                report.outcome
            );
        }
    }

    #[test]
    fn comments_and_strings_do_not_trigger_denial() {
        let snippets = [
            "// never import \"os\" here\nprint(1);",
            "/* import \"sys\" as s; */ print(1);",
            "print(\"import `socket`\");",
            "let doc = `\nimport os\n`; print(1);",
        ];
        for snippet in snippets {
            let report = run(snippet);
            assert_eq!(report.outcome, Outcome::Completed, "snippet {:?}", snippet);
        }
        assert_eq!(code_only("x // import \"os\"\ny"), "x \ny");
        assert!(find_blocked_import("let q = '\"'; import \"os\" as o;").is_some());
    }

    #[test]
    fn dynamic_import_path_is_denied_at_run_time() {
        let report = run(r#"let name = "o" + "s"; import name as m;"#);
        assert_eq!(
            report.outcome,
            Outcome::Denied {
                module: "os".to_string()
            }
        );
    }

    #[test]
    fn eval_is_disabled() {
        let report = run(r#"eval("40 + 2");"#);
        assert!(matches!(report.outcome, Outcome::Failed { .. }));
    }

    #[test]
    fn runtime_errors_are_reported_with_line() {
        let report = run("let a = 1;\nlet b = df_all.sum(\"missing\");");
        match report.outcome {
            Outcome::Failed { message, line } => {
                assert!(message.contains("missing"));
                assert_eq!(line, Some(2));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn runaway_loops_hit_the_operation_ceiling() {
        let config = ExecutorConfig {
            max_operations: 10_000,
        };
        let report = execute("loop { }", &registry(), &config);
        assert!(matches!(report.outcome, Outcome::Failed { .. }));
    }

    #[test]
    fn fig_variable_is_offered_for_export() {
        let report = run(r#"
            let fig = px::line(df_all, "month", "total", "__source__");
            fig.set_title("Totals");
            show(fig);
            show(df_all.head(2));
            show("done");
        "#);
        assert_eq!(report.outcome, Outcome::Completed);
        let fig = report.figure.expect("fig should be captured");
        assert_eq!(fig.options.title, "Totals");
        assert_eq!(fig.series.len(), 2);
        assert_eq!(report.shown.len(), 3);
        assert!(matches!(report.shown[1], Shown::Table { total_rows: 2, .. }));
        assert_eq!(
            report.shown[2],
            Shown::Text {
                text: "done".to_string()
            }
        );
    }

    #[test]
    fn px_can_be_imported_explicitly() {
        let report = run(r#"import "px" as plot; let fig = plot::bar(df_all, "month", "total");"#);
        assert_eq!(report.outcome, Outcome::Completed);
        assert!(report.figure.is_some());
    }

    #[test]
    fn table_helpers_are_callable() {
        let report = run(r#"
            let g = df_all.group_sum("__source__", "total");
            print(g.rows);
            let f = df_all.filter("month", 1);
            print(f.rows);
            let s = df_all.sort_by("total", true);
            print(s.column("total")[0]);
            print(df_all.unique("__source__").len());
        "#);
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.output, vec!["2", "2", "14", "2"]);
    }

    #[test]
    fn blocked_base_matches_dotted_names() {
        assert_eq!(blocked_base("os.path"), Some("os"));
        assert_eq!(blocked_base("importlib/util"), Some("importlib"));
        assert_eq!(blocked_base("osmosis"), None);
        assert_eq!(blocked_base("px"), None);
    }
}
