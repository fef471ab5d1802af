use super::DatasetShape;

/// Driver run as `node -e DRIVER <code-file> <dataset-file> <report-file>`.
///
/// The console functions are swapped for capturing ones while the code runs
/// and restored in `finally`, whatever the code does. Callbacks that fire
/// after the synchronous part log through the restored console, straight to
/// the process stdout.
pub const DRIVER: &str = r#"
(() => {
  const fs = require("fs");
  const util = require("util");
  const [codePath, datasetPath, reportPath] = process.argv.slice(1);
  const source = fs.readFileSync(codePath, "utf8");
  globalThis.dataset = fs.readFileSync(datasetPath, "utf8");

  const lines = [];
  const report = { lines, result: null, error: null };
  const capture = (type) => (...args) => {
    for (const text of util.format(...args).split("\n")) lines.push({ text, type });
  };
  const saved = { log: console.log, info: console.info, warn: console.warn, error: console.error };
  console.log = console.info = capture("plain");
  console.warn = console.error = capture("error");
  try {
    const value = (0, eval)(source);
    if (value !== undefined) report.result = util.format(value);
  } catch (err) {
    report.error = err instanceof Error ? err.toString() : "Uncaught " + util.format(err);
  } finally {
    Object.assign(console, saved);
  }
  fs.writeFileSync(reportPath, JSON.stringify(report));
})();
"#;

pub fn skeleton(shape: DatasetShape) -> String {
    match shape.separator_literal() {
        Some(separator) => format!(
            r#"const rows = dataset.trim().split("\n").map((line) => line.split("{separator}"));
const [header, ...body] = rows;

for (const row of body) {{
  console.log(row);
}}
"#
        ),
        None => r#"const data = dataset.trim();

console.log(data);
"#
        .to_string(),
    }
}
