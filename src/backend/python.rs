use super::DatasetShape;

/// Driver run as `python3 -c DRIVER <code-file> <dataset-file> <report-file>`.
///
/// Captures stdout and stderr into fresh buffers for every run, evaluates a
/// trailing expression statement separately so its value can be reported,
/// and writes one JSON report to the report file. Output of child processes
/// bypasses the buffers and lands on the real stdout.
pub const DRIVER: &str = r#"
import ast, io, json, sys, traceback
from contextlib import redirect_stderr, redirect_stdout

code_path, dataset_path, report_path = sys.argv[1], sys.argv[2], sys.argv[3]
with open(dataset_path, encoding="utf-8") as handle:
    dataset = handle.read()
with open(code_path, encoding="utf-8") as handle:
    source = handle.read()

out, err = io.StringIO(), io.StringIO()
report = {"lines": [], "result": None, "error": None}
try:
    tree = ast.parse(source, "<editor>")
    tail = None
    if tree.body and isinstance(tree.body[-1], ast.Expr):
        tail = ast.Expression(tree.body.pop().value)
    scope = {"__name__": "__main__", "dataset": dataset}
    value = None
    with redirect_stdout(out), redirect_stderr(err):
        exec(compile(tree, "<editor>", "exec"), scope)
        if tail is not None:
            value = eval(compile(tail, "<editor>", "eval"), scope)
    report["lines"] += [{"text": line, "type": "plain"} for line in out.getvalue().splitlines()]
    report["lines"] += [{"text": line, "type": "error"} for line in err.getvalue().splitlines()]
    if value is not None:
        report["result"] = str(value)
except BaseException as exc:
    report["error"] = "".join(traceback.format_exception_only(type(exc), exc)).strip()
sys.stdout.flush()
with open(report_path, "w", encoding="utf-8") as handle:
    json.dump(report, handle)
"#;

pub fn skeleton(shape: DatasetShape) -> String {
    match shape.separator_literal() {
        Some(separator) => format!(
            r#"rows = [line.split("{separator}") for line in dataset.strip().splitlines()]
header, body = rows[0], rows[1:]

for row in body:
    print(row)
"#
        ),
        None => r#"data = dataset.strip()

print(data)
"#
        .to_string(),
    }
}
