//! The control tree: named, typed knobs queried by dotted path
//!
//! A query names a leaf through `token(.token)*`, where a token either
//! matches a child by name or, under an indexed node, parses as a decimal
//! index that is handed to the handler. Leaves are readable, writable,
//! or runnable, and each declares the argument type its write parser
//! accepts when a query arrives from configuration text.
//!
//! Configuration can be injected at open time through the `PMEMOBJ_CONF`
//! environment variable (inline `name=value;...` queries) or a file named
//! by `PMEMOBJ_CONF_FILE` (same syntax, `#` comments, at most 1 MiB).

use crate::error::{fail, Error, Result};
use crate::pool::PmemObjPool;
use crate::stats::StatsEnabled;
use std::sync::atomic::Ordering;

/// The largest configuration file accepted
pub const MAX_CONFIG_FILE_SIZE: usize = 1 << 20;

/// A typed argument crossing the CTL boundary
#[derive(Debug, Clone, PartialEq)]
pub enum CtlValue {
    None,
    Bool(bool),
    LongLong(i64),
    String(String),
}

impl CtlValue {
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            CtlValue::Bool(b) => Ok(*b),
            _ => fail(Error::Invalid("expected a boolean argument")),
        }
    }

    pub fn as_longlong(&self) -> Result<i64> {
        match self {
            CtlValue::LongLong(v) => Ok(*v),
            _ => fail(Error::Invalid("expected an integer argument")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            CtlValue::String(s) => Ok(s),
            _ => fail(Error::Invalid("expected a string argument")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArgKind {
    None,
    Bool,
    LongLong,
    Str,
}

impl ArgKind {
    /// Parses configuration text into the typed argument of a leaf
    fn parse(self, raw: &str) -> Result<CtlValue> {
        match self {
            ArgKind::None => fail(Error::Invalid("leaf takes no argument")),
            ArgKind::Bool => match raw {
                "y" | "Y" | "1" => Ok(CtlValue::Bool(true)),
                "n" | "N" | "0" => Ok(CtlValue::Bool(false)),
                _ => fail(Error::Invalid("malformed boolean")),
            },
            ArgKind::LongLong => raw
                .trim()
                .parse::<i64>()
                .map(CtlValue::LongLong)
                .or_else(|_| fail(Error::Invalid("malformed integer"))),
            ArgKind::Str => Ok(CtlValue::String(raw.to_string())),
        }
    }
}

type Handler = fn(&PmemObjPool, &[u64], &mut CtlValue) -> Result<()>;

struct Leaf {
    arg: ArgKind,
    read: Option<Handler>,
    write: Option<Handler>,
    run: Option<Handler>,
}

enum NodeKind {
    Named,
    /// Matched by an all-digit token; the index is passed to the handler.
    /// Nothing in the core tree is indexed, but a richer heap registers its
    /// arena and allocation-class subtrees this way.
    #[allow(dead_code)]
    Indexed,
    Leaf(Leaf),
}

struct CtlNode {
    name: &'static str,
    kind: NodeKind,
    children: Vec<CtlNode>,
}

fn named(name: &'static str, children: Vec<CtlNode>) -> CtlNode {
    CtlNode {
        name,
        kind: NodeKind::Named,
        children,
    }
}

fn leaf_ro(name: &'static str, read: Handler) -> CtlNode {
    CtlNode {
        name,
        kind: NodeKind::Leaf(Leaf {
            arg: ArgKind::None,
            read: Some(read),
            write: None,
            run: None,
        }),
        children: vec![],
    }
}

fn leaf_rw(name: &'static str, arg: ArgKind, read: Handler, write: Handler) -> CtlNode {
    CtlNode {
        name,
        kind: NodeKind::Leaf(Leaf {
            arg,
            read: Some(read),
            write: Some(write),
            run: None,
        }),
        children: vec![],
    }
}

fn leaf_runnable(name: &'static str, arg: ArgKind, run: Handler) -> CtlNode {
    CtlNode {
        name,
        kind: NodeKind::Leaf(Leaf {
            arg,
            read: None,
            write: None,
            run: Some(run),
        }),
        children: vec![],
    }
}

// -- handlers ---------------------------------------------------------------

fn tx_skip_checks_read(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    *arg = CtlValue::Bool(pool.tx_params.skip_expensive_checks.load(Ordering::Relaxed));
    Ok(())
}

fn tx_skip_checks_write(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    pool.tx_params
        .skip_expensive_checks
        .store(arg.as_bool()?, Ordering::Relaxed);
    Ok(())
}

fn tx_verify_ubuf_read(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    *arg = CtlValue::Bool(pool.user_buffers.verify.load(Ordering::Relaxed));
    Ok(())
}

fn tx_verify_ubuf_write(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    pool.user_buffers
        .verify
        .store(arg.as_bool()?, Ordering::Relaxed);
    Ok(())
}

fn tx_cache_size_read(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    *arg = CtlValue::LongLong(pool.tx_params.cache_size.load(Ordering::Relaxed) as i64);
    Ok(())
}

fn tx_cache_size_write(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    let v = arg.as_longlong()?;
    if v < 0 || v as usize > pool.heap.max_alloc() {
        return fail(Error::Range);
    }
    pool.tx_params.cache_size.store(v as u64, Ordering::Relaxed);
    Ok(())
}

fn heap_granularity_read(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    *arg = CtlValue::LongLong(pool.heap.growsize.load(Ordering::Relaxed) as i64);
    Ok(())
}

fn heap_granularity_write(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    let v = arg.as_longlong()?;
    if v < 0 {
        return fail(Error::Range);
    }
    pool.heap.growsize.store(v as u64, Ordering::Relaxed);
    Ok(())
}

fn heap_extend_run(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    let v = arg.as_longlong()?;
    if v <= 0 {
        return fail(Error::Invalid("extension size must be positive"));
    }
    pool.heap.extend(v as usize)
}

fn alloc_pattern_read(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    *arg = CtlValue::LongLong(pool.heap.alloc_pattern.load(Ordering::Relaxed));
    Ok(())
}

fn alloc_pattern_write(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    let v = arg.as_longlong()?;
    if v > u8::MAX as i64 {
        return fail(Error::Range);
    }
    pool.heap.alloc_pattern.store(v, Ordering::Relaxed);
    Ok(())
}

fn stats_enabled_read(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    *arg = CtlValue::String(pool.stats.enabled().as_str().to_string());
    Ok(())
}

fn stats_enabled_write(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    match StatsEnabled::from_str(arg.as_str()?) {
        Some(mode) => {
            pool.stats.set_enabled(mode);
            Ok(())
        }
        None => fail(Error::Invalid("unknown statistics mode")),
    }
}

fn stats_curr_allocated_read(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    *arg = CtlValue::LongLong(pool.stats.curr_allocated.load(Ordering::Relaxed));
    Ok(())
}

fn stats_run_allocated_read(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    *arg = CtlValue::LongLong(pool.stats.run_allocated.load(Ordering::Relaxed));
    Ok(())
}

fn stats_run_active_read(pool: &PmemObjPool, _i: &[u64], arg: &mut CtlValue) -> Result<()> {
    *arg = CtlValue::LongLong(pool.stats.run_active.load(Ordering::Relaxed));
    Ok(())
}

lazy_static! {
    static ref ROOT: Vec<CtlNode> = vec![
        named(
            "tx",
            vec![
                named(
                    "debug",
                    vec![
                        leaf_rw(
                            "skip_expensive_checks",
                            ArgKind::Bool,
                            tx_skip_checks_read,
                            tx_skip_checks_write,
                        ),
                        leaf_rw(
                            "verify_user_buffers",
                            ArgKind::Bool,
                            tx_verify_ubuf_read,
                            tx_verify_ubuf_write,
                        ),
                    ],
                ),
                named(
                    "cache",
                    vec![leaf_rw(
                        "size",
                        ArgKind::LongLong,
                        tx_cache_size_read,
                        tx_cache_size_write,
                    )],
                ),
            ],
        ),
        named(
            "heap",
            vec![named(
                "size",
                vec![
                    leaf_rw(
                        "granularity",
                        ArgKind::LongLong,
                        heap_granularity_read,
                        heap_granularity_write,
                    ),
                    leaf_runnable("extend", ArgKind::LongLong, heap_extend_run),
                ],
            )],
        ),
        named(
            "stats",
            vec![
                leaf_rw(
                    "enabled",
                    ArgKind::Str,
                    stats_enabled_read,
                    stats_enabled_write,
                ),
                named(
                    "heap",
                    vec![
                        leaf_ro("curr_allocated", stats_curr_allocated_read),
                        leaf_ro("run_allocated", stats_run_allocated_read),
                        leaf_ro("run_active", stats_run_active_read),
                    ],
                ),
            ],
        ),
        named(
            "debug",
            vec![named(
                "heap",
                vec![leaf_rw(
                    "alloc_pattern",
                    ArgKind::LongLong,
                    alloc_pattern_read,
                    alloc_pattern_write,
                )],
            )],
        ),
    ];
}

fn find_leaf<'a>(name: &str, indexes: &mut Vec<u64>) -> Result<&'a Leaf> {
    let mut nodes: &'static [CtlNode] = &ROOT;
    let mut found: Option<&'static CtlNode> = None;

    for token in name.split('.') {
        if token.is_empty() {
            return fail(Error::Invalid("empty ctl path token"));
        }
        let cur = match nodes.iter().find(|n| n.name == token) {
            Some(n) => n,
            None => match token.parse::<u64>() {
                Ok(idx) => {
                    let n = nodes
                        .iter()
                        .find(|n| matches!(n.kind, NodeKind::Indexed))
                        .ok_or(Error::Invalid("unknown ctl node"))?;
                    indexes.push(idx);
                    n
                }
                Err(_) => return fail(Error::Invalid("unknown ctl node")),
            },
        };
        found = Some(cur);
        nodes = &cur.children;
    }

    match found.map(|n| &n.kind) {
        Some(NodeKind::Leaf(l)) => Ok(l),
        _ => fail(Error::Invalid("ctl path does not name a leaf")),
    }
}

/// Reads the leaf named by `name`
pub fn get(pool: &PmemObjPool, name: &str) -> Result<CtlValue> {
    let mut indexes = vec![];
    let leaf = find_leaf(name, &mut indexes)?;
    let read = match leaf.read {
        Some(r) => r,
        None => return fail(Error::Invalid("ctl leaf is not readable")),
    };
    let mut out = CtlValue::None;
    read(pool, &indexes, &mut out)?;
    Ok(out)
}

/// Writes the leaf named by `name` with a typed argument
pub fn set(pool: &PmemObjPool, name: &str, mut arg: CtlValue) -> Result<()> {
    let mut indexes = vec![];
    let leaf = find_leaf(name, &mut indexes)?;
    let write = match leaf.write {
        Some(w) => w,
        None => return fail(Error::Invalid("ctl leaf is not writable")),
    };
    write(pool, &indexes, &mut arg)
}

/// Executes a runnable leaf
pub fn exec(pool: &PmemObjPool, name: &str, mut arg: CtlValue) -> Result<()> {
    let mut indexes = vec![];
    let leaf = find_leaf(name, &mut indexes)?;
    let run = match leaf.run {
        Some(r) => r,
        None => return fail(Error::Invalid("ctl leaf is not runnable")),
    };
    run(pool, &indexes, &mut arg)
}

/// Executes one `name=value` query coming from configuration text
pub fn set_from_config(pool: &PmemObjPool, name: &str, raw: &str) -> Result<()> {
    let mut indexes = vec![];
    let leaf = find_leaf(name, &mut indexes)?;
    let mut arg = leaf.arg.parse(raw)?;
    if let Some(write) = leaf.write {
        return write(pool, &indexes, &mut arg);
    }
    if let Some(run) = leaf.run {
        return run(pool, &indexes, &mut arg);
    }
    fail(Error::Invalid("ctl leaf is not writable"))
}

/// Splits `;`-separated `name=value` queries, ignoring surrounding blanks
pub fn parse_config_string(input: &str) -> Result<Vec<(String, String)>> {
    let mut out = vec![];
    for q in input.split(';') {
        let q: String = q.chars().filter(|c| !c.is_whitespace()).collect();
        if q.is_empty() {
            continue;
        }
        let mut it = q.splitn(2, '=');
        let name = it.next().unwrap_or("");
        let value = it.next();
        match value {
            Some(v) if !name.is_empty() && !v.is_empty() => {
                out.push((name.to_string(), v.to_string()))
            }
            _ => return fail(Error::Invalid("malformed ctl query")),
        }
    }
    Ok(out)
}

/// Runs every query of a configuration string against the pool
pub fn load_config_string(pool: &PmemObjPool, input: &str) -> Result<()> {
    for (name, value) in parse_config_string(input)? {
        set_from_config(pool, &name, &value)?;
    }
    Ok(())
}

/// Reads a configuration file: `#` starts a comment, blanks are ignored
pub fn load_config_file(pool: &PmemObjPool, path: &str) -> Result<()> {
    let meta = std::fs::metadata(path)?;
    if meta.len() as usize > MAX_CONFIG_FILE_SIZE {
        return fail(Error::Invalid("configuration file too large"));
    }
    let content = std::fs::read_to_string(path)?;
    let stripped: String = content
        .lines()
        .map(|l| l.split('#').next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join(";");
    load_config_string(pool, &stripped)
}

/// Applies `PMEMOBJ_CONF` and `PMEMOBJ_CONF_FILE` to a freshly opened pool
pub fn load_env_config(pool: &PmemObjPool) -> Result<()> {
    if let Ok(conf) = std::env::var("PMEMOBJ_CONF") {
        load_config_string(pool, &conf)?;
    }
    if let Ok(path) = std::env::var("PMEMOBJ_CONF_FILE") {
        load_config_file(pool, &path)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_string_splits_queries() {
        let qs = parse_config_string("a.b=1; c.d = yes ;;").unwrap();
        assert_eq!(
            qs,
            vec![
                ("a.b".to_string(), "1".to_string()),
                ("c.d".to_string(), "yes".to_string())
            ]
        );
        assert!(parse_config_string("novalue").is_err());
        assert!(parse_config_string("=1").is_err());
    }

    #[test]
    fn boolean_arguments_accept_the_documented_spellings() {
        for t in &["y", "Y", "1"] {
            assert_eq!(ArgKind::Bool.parse(t).unwrap(), CtlValue::Bool(true));
        }
        for f in &["n", "N", "0"] {
            assert_eq!(ArgKind::Bool.parse(f).unwrap(), CtlValue::Bool(false));
        }
        assert!(ArgKind::Bool.parse("true").is_err());
    }

    #[test]
    fn integer_arguments_parse_or_reject() {
        assert_eq!(
            ArgKind::LongLong.parse("-12").unwrap(),
            CtlValue::LongLong(-12)
        );
        assert!(ArgKind::LongLong.parse("12x").is_err());
    }

    #[test]
    fn unknown_paths_are_invalid() {
        let mut idx = vec![];
        assert!(find_leaf("tx.debug.skip_expensive_checks", &mut idx).is_ok());
        assert!(find_leaf("tx.debug", &mut idx).is_err());
        assert!(find_leaf("tx.nope", &mut idx).is_err());
        assert!(find_leaf("", &mut idx).is_err());
    }
}
