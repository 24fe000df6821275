use permquery::catalog::schema::KindSpec;
use permquery::query::QueryLimits;
use permquery::query::filter::compile_filter;
use permquery::{
    Catalog, MemoryExecutor, QueryParams, QueryService, Record, Relationship, RequesterContext,
    ServiceConfig, Value,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

#[derive(Deserialize)]
struct Fixture {
    kinds: Vec<KindSpec>,
    #[serde(default)]
    records: BTreeMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    config: Option<ServiceConfig>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "compile" => cmd_compile(&args[2..]),
        "list" => cmd_list(&args[2..]),
        "get" => cmd_get(&args[2..]),
        "edge" => cmd_edge(&args[2..]),
        other => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
    }
}

fn cmd_compile(args: &[String]) -> Result<(), String> {
    let [path, kind, filter, ..] = args else {
        return Err("usage: permquery compile <fixture.json> <kind> <filter>".into());
    };
    let fixture = load_fixture(path)?;
    let catalog = Catalog::from_specs(fixture.kinds).map_err(|e| e.to_string())?;
    let schema = catalog.require(kind).map_err(|e| e.to_string())?;
    let limits = fixture
        .config
        .map(|c| c.limits())
        .unwrap_or_else(QueryLimits::default);
    match compile_filter(schema, filter, |_| true, &limits).map_err(|e| e.to_string())? {
        Some(expr) => println!("{}", expr.canonical()),
        None => println!("(no filter)"),
    }
    Ok(())
}

fn cmd_list(args: &[String]) -> Result<(), String> {
    let [path, kind, rest @ ..] = args else {
        return Err("usage: permquery list <fixture.json> <kind> [key=value...]".into());
    };
    let (params, requester) = parse_request(rest)?;
    let service = build_service(path)?;
    let page = block_on(service.list(kind, &params, &requester))?.map_err(|e| e.to_string())?;
    print_json(&page.to_json())
}

fn cmd_get(args: &[String]) -> Result<(), String> {
    let [path, kind, id, rest @ ..] = args else {
        return Err("usage: permquery get <fixture.json> <kind> <id> [key=value...]".into());
    };
    let (params, requester) = parse_request(rest)?;
    let service = build_service(path)?;
    let id = service.parse_id(kind, id).map_err(|e| e.to_string())?;
    let record = block_on(service.get(kind, &id, &params, &requester))?.map_err(|e| e.to_string())?;
    print_json(&record.to_json())
}

fn cmd_edge(args: &[String]) -> Result<(), String> {
    let [path, kind, id, edge, rest @ ..] = args else {
        return Err("usage: permquery edge <fixture.json> <kind> <id> <edge> [key=value...]".into());
    };
    let (params, requester) = parse_request(rest)?;
    let service = build_service(path)?;
    let id = service.parse_id(kind, id).map_err(|e| e.to_string())?;
    let page = block_on(service.list_edge(kind, &id, edge, &params, &requester))?
        .map_err(|e| e.to_string())?;
    print_json(&page.to_json())
}

fn load_fixture(path: &str) -> Result<Fixture, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("read {path}: {e}"))?;
    serde_json::from_str(&text).map_err(|e| format!("parse {path}: {e}"))
}

fn build_service(path: &str) -> Result<QueryService, String> {
    let fixture = load_fixture(path)?;
    let catalog = Arc::new(Catalog::from_specs(fixture.kinds).map_err(|e| e.to_string())?);
    let executor = MemoryExecutor::new(catalog.clone());
    for (kind, rows) in &fixture.records {
        for row in rows {
            let record = Record::from_json(row)
                .ok_or_else(|| format!("{kind}: records must be flat JSON objects"))?;
            executor.insert(kind, record).map_err(|e| e.to_string())?;
        }
    }
    QueryService::from_config(catalog, Arc::new(executor), fixture.config.unwrap_or_default())
        .map_err(|e| e.to_string())
}

/// Splits `key=value` query parameters from `--caller`, `--group` and `--as`
/// requester flags.
fn parse_request(args: &[String]) -> Result<(QueryParams, RequesterContext), String> {
    let mut params = QueryParams::default();
    let mut requester = RequesterContext::anonymous();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--caller" => {
                let value = iter.next().ok_or("--caller needs a value")?;
                requester.caller_id = Some(parse_value(value));
            }
            "--group" => {
                let value = iter.next().ok_or("--group needs a value")?;
                requester.groups.push(parse_value(value));
            }
            "--as" => {
                let rel = match iter.next().map(String::as_str) {
                    Some("owner") => Relationship::Owner,
                    Some("group") => Relationship::Group,
                    Some("other") => Relationship::Other,
                    _ => return Err("--as needs one of owner, group, other".into()),
                };
                requester.relationship_hint = Some(rel);
            }
            pair => {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
                params = params.with(key, value);
            }
        }
    }
    Ok((params, requester))
}

/// JSON scalars keep their type; anything else is taken as text.
fn parse_value(text: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| Value::from_json(&v))
        .unwrap_or_else(|| Value::from(text))
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("runtime: {e}"))?;
    Ok(runtime.block_on(future))
}

fn print_json(value: &serde_json::Value) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{text}");
    Ok(())
}

fn print_usage() {
    eprintln!(
        "permquery <command>\n\
         \n\
         commands:\n\
         \x20 compile <fixture.json> <kind> <filter>\n\
         \x20 list <fixture.json> <kind> [key=value...] [--caller V] [--group V] [--as owner|group|other]\n\
         \x20 get <fixture.json> <kind> <id> [key=value...] [requester flags]\n\
         \x20 edge <fixture.json> <kind> <id> <edge> [key=value...] [requester flags]"
    );
}
