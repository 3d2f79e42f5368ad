//! Command argument parsing.
//!
//! The parser never throws for user mistakes. Malformed argv, a missing
//! required argument, or an explicit `--help` all land in the same help
//! state: usage and diagnostic lines accumulate in `mesgs`, `exited` is
//! set, and `parse_args` returns `None`. The calling command prints the
//! messages and finishes without executing.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use common_error::{StrataError, StrataResult};
use strata_core::{ArgAction, CmdArgDef, Nargs, TypeModel, Value};

// ============================================================================
// Argument specs
// ============================================================================

/// One argument accepted by a [`Parser`].
#[derive(Debug, Clone)]
pub struct ArgSpec {
    names: Vec<String>,
    dest: String,
    action: ArgAction,
    nargs: Option<Nargs>,
    argtype: Option<String>,
    default: Option<Value>,
    required: bool,
    help: String,
}

impl ArgSpec {
    /// Create a spec from its spellings. A leading dash marks an option;
    /// the destination name derives from the longest spelling with
    /// dashes stripped and interior dashes mapped to underscores.
    pub fn new(names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let mut longest = names.first().cloned().unwrap_or_default();
        for name in &names {
            if name.len() > longest.len() {
                longest = name.clone();
            }
        }
        let dest = longest.trim_start_matches('-').replace('-', "_");
        Self {
            names,
            dest,
            action: ArgAction::Store,
            nargs: None,
            argtype: None,
            default: None,
            required: false,
            help: String::new(),
        }
    }

    /// Build a spec from a declarative command argument definition.
    pub fn from_def(def: &CmdArgDef) -> Self {
        let mut names: Vec<&str> = vec![def.name.as_str()];
        names.extend(def.names.iter().map(String::as_str));
        let mut spec = Self::new(&names);
        spec.action = def.action;
        spec.nargs = def.nargs;
        spec.argtype = def.argtype.clone();
        spec.default = def.default.clone();
        spec.required = def.required;
        spec.help = def.help.clone().unwrap_or_default();
        spec
    }

    pub fn action(mut self, action: ArgAction) -> Self {
        self.action = action;
        self
    }

    pub fn nargs(mut self, nargs: Nargs) -> Self {
        self.nargs = Some(nargs);
        self
    }

    pub fn argtype(mut self, argtype: impl Into<String>) -> Self {
        self.argtype = Some(argtype.into());
        self
    }

    pub fn default(mut self, valu: Value) -> Self {
        self.default = Some(valu);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    fn is_opt(&self) -> bool {
        self.names.iter().all(|n| n.starts_with('-'))
    }

    fn fallback(&self) -> Value {
        if let Some(valu) = &self.default {
            return valu.clone();
        }
        match self.action {
            ArgAction::StoreTrue => Value::Bool(false),
            ArgAction::StoreFalse => Value::Bool(true),
            ArgAction::Append => Value::List(Vec::new()),
            ArgAction::Store => Value::Null,
        }
    }
}

// ============================================================================
// Parsed options
// ============================================================================

/// Parsed argument values keyed by destination name.
#[derive(Debug, Clone, Default)]
pub struct CmdOpts {
    vals: HashMap<String, Value>,
}

impl CmdOpts {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vals.get(name)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.vals
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.vals.get(name).and_then(Value::as_int)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.vals.get(name).and_then(Value::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, valu: Value) {
        self.vals.insert(name.into(), valu);
    }

    /// Freeze the options into a value map (the `$cmdopts` frame var).
    pub fn to_value(&self) -> Value {
        let map: BTreeMap<String, Value> =
            self.vals.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Value::Map(map)
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Argv parser for pipeline commands.
pub struct Parser {
    prog: String,
    descr: String,
    specs: Vec<ArgSpec>,
    optnames: HashMap<String, usize>,
    posargs: Vec<usize>,
    /// Usage and diagnostic lines accumulated by the help state.
    pub mesgs: Vec<String>,
    /// Set once the parser entered the help state.
    pub exited: bool,
    model: Arc<dyn TypeModel>,
}

impl Parser {
    /// Create a parser with the implicit `--help` option registered.
    pub fn new(prog: impl Into<String>, descr: impl Into<String>, model: Arc<dyn TypeModel>) -> Self {
        let mut pars = Self {
            prog: prog.into(),
            descr: descr.into(),
            specs: Vec::new(),
            optnames: HashMap::new(),
            posargs: Vec::new(),
            mesgs: Vec::new(),
            exited: false,
            model,
        };
        // registration of the implicit option cannot fail
        let _ = pars.add_argument(
            ArgSpec::new(&["--help", "-h"])
                .action(ArgAction::StoreTrue)
                .default(Value::Bool(false))
                .help("Display the command usage."),
        );
        pars
    }

    /// Register an argument spec.
    ///
    /// Fails with `BadArg` when the spec names a type the model does not
    /// define; user input never reaches this path.
    pub fn add_argument(&mut self, spec: ArgSpec) -> StrataResult<()> {
        if let Some(argtype) = &spec.argtype {
            if !self.model.has_type(argtype) {
                return Err(StrataError::bad_arg(format!(
                    "Argument type must be a valid model type name: {argtype}"
                )));
            }
        }
        let idx = self.specs.len();
        if spec.is_opt() {
            for name in &spec.names {
                self.optnames.insert(name.clone(), idx);
            }
        } else {
            self.posargs.push(idx);
        }
        self.specs.push(spec);
        Ok(())
    }

    /// Parse argv into options.
    ///
    /// Returns `None` when the parser entered the help state; the caller
    /// prints `mesgs` and declines to execute.
    pub fn parse_args(&mut self, argv: &[Value]) -> Option<CmdOpts> {
        let mut todo: VecDeque<Value> = argv.to_vec().into();
        let mut vals: HashMap<String, Value> = HashMap::new();
        let mut positional: Vec<Value> = Vec::new();

        while let Some(item) = todo.pop_front() {
            let optidx = item.as_str().and_then(|name| self.optnames.get(name)).copied();
            let Some(idx) = optidx else {
                positional.push(item);
                continue;
            };
            let spec = self.specs[idx].clone();
            match spec.action {
                ArgAction::StoreTrue => {
                    vals.insert(spec.dest.clone(), Value::Bool(true));
                }
                ArgAction::StoreFalse => {
                    vals.insert(spec.dest.clone(), Value::Bool(false));
                }
                ArgAction::Store => {
                    let valu = match self.consume(&spec, &mut todo) {
                        Ok(valu) => valu,
                        Err(()) => return None,
                    };
                    vals.insert(spec.dest.clone(), valu);
                }
                ArgAction::Append => {
                    let valu = match self.consume(&spec, &mut todo) {
                        Ok(valu) => valu,
                        Err(()) => return None,
                    };
                    match vals
                        .entry(spec.dest.clone())
                        .or_insert_with(|| Value::List(Vec::new()))
                    {
                        Value::List(items) => items.push(valu),
                        other => *other = Value::List(vec![valu]),
                    }
                }
            }
        }

        if vals.get("help").and_then(Value::as_bool).unwrap_or(false) {
            self.help(None);
            return None;
        }

        let mut postodo: VecDeque<Value> = positional.into();
        for idx in self.posargs.clone() {
            let spec = self.specs[idx].clone();
            match spec.nargs {
                None => match self.take_one(&spec, &mut postodo) {
                    Some(Ok(valu)) => {
                        vals.insert(spec.dest.clone(), valu);
                    }
                    Some(Err(())) => return None,
                    None => {
                        self.help(Some(&format!(
                            "The argument <{}> is required.",
                            spec.names[0]
                        )));
                        return None;
                    }
                },
                Some(Nargs::Opt) => {
                    if let Some(res) = self.take_one(&spec, &mut postodo) {
                        match res {
                            Ok(valu) => {
                                vals.insert(spec.dest.clone(), valu);
                            }
                            Err(()) => return None,
                        }
                    }
                }
                Some(Nargs::Exact(count)) => {
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        match self.take_one(&spec, &mut postodo) {
                            Some(Ok(valu)) => items.push(valu),
                            Some(Err(())) => return None,
                            None => {
                                self.help(Some(&format!(
                                    "{count} arguments are required for {}.",
                                    spec.names[0]
                                )));
                                return None;
                            }
                        }
                    }
                    vals.insert(spec.dest.clone(), Value::List(items));
                }
                Some(Nargs::Star) | Some(Nargs::Plus) => {
                    let mut items = Vec::new();
                    while let Some(res) = self.take_one(&spec, &mut postodo) {
                        match res {
                            Ok(valu) => items.push(valu),
                            Err(()) => return None,
                        }
                    }
                    if items.is_empty() && matches!(spec.nargs, Some(Nargs::Plus)) {
                        self.help(Some(&format!(
                            "At least one argument is required for {}.",
                            spec.names[0]
                        )));
                        return None;
                    }
                    vals.insert(spec.dest.clone(), Value::List(items));
                }
            }
        }

        if !postodo.is_empty() {
            self.help(Some(&format!(
                "Expected {} positional arguments. Got {}.",
                self.posargs.len(),
                self.posargs.len() + postodo.len()
            )));
            return None;
        }

        for spec in self.specs.clone() {
            if vals.contains_key(&spec.dest) {
                continue;
            }
            if spec.required {
                self.help(Some(&format!(
                    "The argument {} is required.",
                    spec.names[0]
                )));
                return None;
            }
            vals.insert(spec.dest.clone(), spec.fallback());
        }

        Some(CmdOpts { vals })
    }

    /// Enter the help state, accumulating usage lines and an optional
    /// diagnostic.
    pub fn help(&mut self, mesg: Option<&str>) {
        self.mesgs.push(format!("usage: {}", self.usage_line()));
        if !self.descr.is_empty() {
            self.mesgs.push(String::new());
            self.mesgs.push(self.descr.clone());
        }
        let lines: Vec<String> = self
            .specs
            .iter()
            .map(|spec| format!("  {:<24} : {}", spec.names.join(", "), spec.help))
            .collect();
        self.mesgs.push(String::new());
        self.mesgs.extend(lines);
        if let Some(mesg) = mesg {
            self.mesgs.push(String::new());
            self.mesgs.push(format!("ERROR: {mesg}"));
        }
        self.exited = true;
    }

    fn usage_line(&self) -> String {
        let mut parts = vec![self.prog.clone(), "[options]".to_string()];
        for idx in &self.posargs {
            parts.push(format!("<{}>", self.specs[*idx].names[0]));
        }
        parts.join(" ")
    }

    fn consume(&mut self, spec: &ArgSpec, todo: &mut VecDeque<Value>) -> Result<Value, ()> {
        match spec.nargs {
            None => match self.take_one(spec, todo) {
                Some(res) => res,
                None => {
                    self.help(Some(&format!(
                        "An argument is required for {}.",
                        spec.names[0]
                    )));
                    Err(())
                }
            },
            Some(Nargs::Opt) => match self.peek_token(todo) {
                true => self.take_one(spec, todo).unwrap_or(Ok(Value::Null)),
                false => Ok(spec.fallback()),
            },
            Some(Nargs::Exact(count)) => {
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    match self.take_one(spec, todo) {
                        Some(res) => items.push(res?),
                        None => {
                            self.help(Some(&format!(
                                "{count} arguments are required for {}.",
                                spec.names[0]
                            )));
                            return Err(());
                        }
                    }
                }
                Ok(Value::List(items))
            }
            Some(Nargs::Star) | Some(Nargs::Plus) => {
                let mut items = Vec::new();
                while self.peek_token(todo) {
                    match self.take_one(spec, todo) {
                        Some(res) => items.push(res?),
                        None => break,
                    }
                }
                if items.is_empty() && matches!(spec.nargs, Some(Nargs::Plus)) {
                    self.help(Some(&format!(
                        "At least one argument is required for {}.",
                        spec.names[0]
                    )));
                    return Err(());
                }
                Ok(Value::List(items))
            }
        }
    }

    /// True when the next token exists and is not an option spelling.
    fn peek_token(&self, todo: &VecDeque<Value>) -> bool {
        match todo.front() {
            Some(valu) => valu
                .as_str()
                .map_or(true, |name| !self.optnames.contains_key(name)),
            None => false,
        }
    }

    fn take_one(
        &mut self,
        spec: &ArgSpec,
        todo: &mut VecDeque<Value>,
    ) -> Option<Result<Value, ()>> {
        if !self.peek_token(todo) {
            return None;
        }
        let valu = todo.pop_front()?;
        let Some(argtype) = &spec.argtype else {
            return Some(Ok(valu));
        };
        match self.model.norm(argtype, &valu) {
            Ok(normed) => Some(Ok(normed)),
            Err(err) => {
                let mesg = err.to_string();
                self.help(Some(&mesg));
                Some(Err(()))
            }
        }
    }
}
