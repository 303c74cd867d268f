//! Tree-sitter front end for C and C++.
//!
//! The grammar keeps preprocessor directives in the tree, so one walk in
//! document order both evaluates conditionals against the running macro
//! state and collects declarations from the active branches. Included headers
//! are walked in place, which makes every header variant a function of the
//! macro context it was included under.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use once_cell::sync::Lazy;
use tree_sitter::{Language, Node, Parser, Tree};

use crate::error::{IndexerError, Result};
use crate::index::{BindingKind, ClassKey, ConstValue, MacroRecord};
use crate::indexer::access::AccessStep;
use crate::indexer::parse::{
    content_fingerprint, linkage_for, modified_ms, Linkage, NameRole, NameSyntax, ParamPassing,
    ParseRequest, ParsedFile, ParsedInclude, ParsedName, SignificantMacros, SourceParser,
    SymbolRef,
};
use crate::location::lexical_normalize;

static CPP_LANGUAGE: Lazy<Language> = Lazy::new(|| tree_sitter_cpp::LANGUAGE.into());

/// [`SourceParser`] backed by tree-sitter-cpp. The C++ grammar is a superset
/// that parses C sources well enough for indexing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeSitterFrontend;

impl TreeSitterFrontend {
    pub fn new() -> Self {
        Self
    }
}

impl SourceParser for TreeSitterFrontend {
    fn parse(&self, request: &ParseRequest) -> Result<Vec<ParsedFile>> {
        Session::new(request)?.run()
    }
}

struct LoadedFile {
    path: PathBuf,
    source: String,
    tree: Tree,
    /// Macro of a classic `#ifndef G / #define G ... #endif` guard.
    guard: Option<String>,
    fingerprint: u64,
    timestamp: i64,
}

impl LoadedFile {
    fn text<'s>(&'s self, node: Node<'_>) -> &'s str {
        self.source
            .get(node.start_byte()..node.end_byte())
            .unwrap_or("")
    }
}

/// Output of one file variant while it is being walked.
struct Frame {
    linkage: Linkage,
    guard: Option<String>,
    significant: SignificantMacros,
    /// Macros defined or undefined by this file or its includes.
    touched: HashSet<String>,
    includes: Vec<ParsedInclude>,
    macros: Vec<MacroRecord>,
    names: Vec<ParsedName>,
}

#[derive(Debug, Clone)]
struct Entry {
    kind: BindingKind,
    params: Option<Vec<ParamPassing>>,
    variadic: bool,
    /// Class (or typedef) naming the type of a variable or field.
    var_type: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Type,
    Value,
}

impl Space {
    fn admits(self, kind: &BindingKind) -> bool {
        let is_type = matches!(
            kind,
            BindingKind::Namespace
                | BindingKind::Class { .. }
                | BindingKind::Enumeration
                | BindingKind::Typedef
        );
        match self {
            Space::Type => is_type,
            Space::Value => !is_type,
        }
    }
}

/// Declarations seen so far in the translation unit.
#[derive(Debug, Default)]
struct SymbolTable {
    entries: HashMap<Vec<String>, Vec<Entry>>,
    bases: HashMap<Vec<String>, Vec<Vec<String>>>,
}

impl SymbolTable {
    fn declare(&mut self, qname: &[String], entry: Entry) {
        let entries = self.entries.entry(qname.to_vec()).or_default();
        match entries.iter_mut().find(|e| e.kind.tag() == entry.kind.tag()) {
            Some(existing) => {
                existing.kind.merge(&entry.kind);
                if entry.params.is_some() {
                    existing.params = entry.params;
                    existing.variadic = entry.variadic;
                }
                if entry.var_type.is_some() {
                    existing.var_type = entry.var_type;
                }
            }
            None => entries.push(entry),
        }
    }

    fn get(&self, qname: &[String], space: Space) -> Option<&Entry> {
        self.entries
            .get(qname)?
            .iter()
            .find(|e| space.admits(&e.kind))
    }

    /// Looks `parts` up from the innermost enclosing scope outwards.
    fn lookup(&self, parts: &[String], scope: &[String], space: Space) -> Option<(Vec<String>, Entry)> {
        if parts.is_empty() {
            return None;
        }
        (0..=scope.len()).rev().find_map(|depth| {
            let mut qname = scope[..depth].to_vec();
            qname.extend_from_slice(parts);
            self.get(&qname, space).map(|e| (qname, e.clone()))
        })
    }

    fn member(&self, class: &[String], name: &str, depth: usize) -> Option<(Vec<String>, Entry)> {
        let mut qname = class.to_vec();
        qname.push(name.to_string());
        if let Some(entry) = self.get(&qname, Space::Value) {
            return Some((qname, entry.clone()));
        }
        if depth > 8 {
            return None;
        }
        self.bases
            .get(class)
            .into_iter()
            .flatten()
            .find_map(|base| self.member(base, name, depth + 1))
    }

    /// Member named `name` when exactly one class declares it.
    fn unique_member(&self, name: &str) -> Option<(Vec<String>, Entry)> {
        let mut found = self.entries.iter().filter_map(|(qname, entries)| {
            if qname.len() < 2 || qname.last().map(String::as_str) != Some(name) {
                return None;
            }
            entries
                .iter()
                .find(|e| matches!(e.kind, BindingKind::Field | BindingKind::Function { .. }))
                .map(|e| (qname.clone(), e.clone()))
        });
        let first = found.next()?;
        found.next().is_none().then_some(first)
    }

    fn inherits_virtual(&self, class: &[String], name: &str) -> bool {
        self.bases
            .get(class)
            .into_iter()
            .flatten()
            .any(|base| {
                self.member(base, name, 0)
                    .map(|(_, e)| e.kind.is_virtual())
                    .unwrap_or(false)
            })
    }

    fn is_class(&self, qname: &[String]) -> bool {
        self.get(qname, Space::Type)
            .map(|e| matches!(e.kind, BindingKind::Class { .. }))
            .unwrap_or(false)
    }

    /// Follows typedefs to the class they name.
    fn resolve_class(&self, qname: Vec<String>) -> Vec<String> {
        let mut current = qname;
        for _ in 0..4 {
            match self.get(&current, Space::Type) {
                Some(Entry {
                    kind: BindingKind::Typedef,
                    var_type: Some(target),
                    ..
                }) if *target != current => current = target.clone(),
                _ => break,
            }
        }
        current
    }
}

#[derive(Debug, Clone, Default)]
struct Ctx {
    scope: Vec<String>,
    class: Option<Vec<String>>,
    in_function: bool,
}

impl Ctx {
    fn nested(&self, scope: Vec<String>, class: bool) -> Ctx {
        Ctx {
            class: if class { Some(scope.clone()) } else { None },
            scope,
            in_function: false,
        }
    }
}

/// Shape of a declarator from the outside in.
#[derive(Default)]
struct DeclShape<'t> {
    name: Option<Node<'t>>,
    function: Option<Node<'t>>,
    reference: bool,
    /// `const` on each pointer or array level, outermost first.
    levels: Vec<bool>,
}

struct Session<'r> {
    request: &'r ParseRequest,
    /// Linkage of the unit; headers take the linkage of their includer.
    linkage: Linkage,
    parser: Parser,
    loaded: HashMap<PathBuf, Rc<LoadedFile>>,
    macros: HashMap<String, String>,
    symbols: SymbolTable,
    locals: Vec<HashMap<String, Option<Vec<String>>>>,
    once: HashSet<PathBuf>,
    last_variant: HashMap<PathBuf, SignificantMacros>,
    stack: Vec<PathBuf>,
    headers: Vec<ParsedFile>,
}

impl<'r> Session<'r> {
    fn new(request: &'r ParseRequest) -> Result<Self> {
        let mut parser = Parser::new();
        parser
            .set_language(&CPP_LANGUAGE)
            .map_err(|e| IndexerError::Parse(e.to_string()))?;
        Ok(Self {
            request,
            linkage: linkage_for(&request.path, request.header_linkage),
            parser,
            loaded: HashMap::new(),
            macros: HashMap::new(),
            symbols: SymbolTable::default(),
            locals: Vec::new(),
            once: HashSet::new(),
            last_variant: HashMap::new(),
            stack: Vec::new(),
            headers: Vec::new(),
        })
    }

    fn run(mut self) -> Result<Vec<ParsedFile>> {
        let request = self.request;
        let path = absolute(&request.path)?;
        let file = match &request.content {
            Some(content) => Rc::new(self.load_source(&path, content.clone(), modified_ms(&path))?),
            None => self.load(&path)?,
        };
        for (name, value) in &request.defines {
            self.macros.insert(name.clone(), value.clone());
        }
        let (unit, _) = self.walk_file(file, self.linkage);
        let mut out = Vec::with_capacity(self.headers.len() + 1);
        out.push(unit);
        out.append(&mut self.headers);
        tracing::debug!("Parsed {} into {} file variants", path.display(), out.len());
        Ok(out)
    }

    fn load(&mut self, path: &Path) -> Result<Rc<LoadedFile>> {
        if let Some(file) = self.loaded.get(path) {
            return Ok(file.clone());
        }
        let bytes = std::fs::read(path)?;
        let source = String::from_utf8_lossy(&bytes).into_owned();
        let file = Rc::new(self.load_source(path, source, modified_ms(path))?);
        self.loaded.insert(path.to_path_buf(), file.clone());
        Ok(file)
    }

    fn load_source(&mut self, path: &Path, source: String, timestamp: i64) -> Result<LoadedFile> {
        let tree = self
            .parser
            .parse(&source, None)
            .ok_or_else(|| IndexerError::Parse(format!("Failed to parse {}", path.display())))?;
        let guard = include_guard(tree.root_node(), &source);
        Ok(LoadedFile {
            path: path.to_path_buf(),
            fingerprint: content_fingerprint(source.as_bytes()),
            timestamp,
            guard,
            tree,
            source,
        })
    }

    fn walk_file(&mut self, file: Rc<LoadedFile>, linkage: Linkage) -> (ParsedFile, HashSet<String>) {
        let mut frame = Frame {
            linkage,
            guard: file.guard.clone(),
            significant: SignificantMacros::new(),
            touched: HashSet::new(),
            includes: Vec::new(),
            macros: Vec::new(),
            names: Vec::new(),
        };
        self.stack.push(file.path.clone());
        let root = file.tree.root_node();
        self.visit_children(&mut frame, &file, root, &Ctx::default());
        self.stack.pop();

        let parsed = ParsedFile {
            path: file.path.clone(),
            location: None,
            linkage,
            significant_macros: frame.significant,
            fingerprint: file.fingerprint,
            timestamp: file.timestamp,
            includes: frame.includes,
            macros: frame.macros,
            names: frame.names,
        };
        (parsed, frame.touched)
    }

    // ------------------------------------------------------------------
    // Preprocessor
    // ------------------------------------------------------------------

    /// Current value of `name`, recording it as significant when its state
    /// comes from the including context.
    fn test_macro(&mut self, f: &mut Frame, name: &str) -> Option<String> {
        let value = self.macros.get(name).cloned();
        if !f.touched.contains(name)
            && f.guard.as_deref() != Some(name)
            && f.significant.get(name).is_none()
        {
            f.significant.insert(name, value.clone());
        }
        value
    }

    fn define_macro(&mut self, f: &mut Frame, src: &LoadedFile, node: Node) {
        let Some(name) = node.child_by_field_name("name") else {
            return;
        };
        let name = src.text(name).to_string();
        let value = node
            .child_by_field_name("value")
            .map(|v| src.text(v).trim().to_string())
            .unwrap_or_default();
        self.macros.insert(name.clone(), value.clone());
        f.touched.insert(name.clone());
        f.macros.push(MacroRecord {
            name,
            expansion: Some(value),
            offset: node.start_byte() as u32,
        });
    }

    fn visit_directive(&mut self, f: &mut Frame, src: &LoadedFile, node: Node) {
        let directive = node
            .child_by_field_name("directive")
            .map(|d| src.text(d).trim())
            .unwrap_or("");
        let argument = node
            .child_by_field_name("argument")
            .map(|a| src.text(a).trim())
            .unwrap_or("");
        match directive {
            "#undef" => {
                let Some(name) = argument.split_whitespace().next() else {
                    return;
                };
                self.macros.remove(name);
                f.touched.insert(name.to_string());
                f.macros.push(MacroRecord {
                    name: name.to_string(),
                    expansion: None,
                    offset: node.start_byte() as u32,
                });
            }
            "#pragma" if argument == "once" => {
                self.once.insert(src.path.clone());
            }
            _ => {}
        }
    }

    fn visit_conditional(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx) {
        let taken = match node.kind() {
            "preproc_ifdef" | "preproc_elifdef" => {
                let name = node
                    .child_by_field_name("name")
                    .map(|n| src.text(n).to_string())
                    .unwrap_or_default();
                self.test_macro(f, &name).is_some() != is_negated(node)
            }
            _ => node
                .child_by_field_name("condition")
                .map(|c| self.eval_condition(f, src, c) != 0)
                .unwrap_or(false),
        };
        self.visit_branch(f, src, node, ctx, taken);
        if let Some(alternative) = node.child_by_field_name("alternative") {
            if taken {
                self.visit_inactive(f, src, alternative);
            } else if alternative.kind() == "preproc_else" {
                self.visit_branch(f, src, alternative, ctx, true);
            } else {
                self.visit_conditional(f, src, alternative, ctx);
            }
        }
    }

    fn visit_branch(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx, active: bool) {
        for item in branch_items(node) {
            if active {
                self.visit(f, src, item, ctx);
            } else {
                self.visit_inactive(f, src, item);
            }
        }
    }

    /// Skipped code only contributes inactive include records.
    fn visit_inactive(&mut self, f: &mut Frame, src: &LoadedFile, node: Node) {
        if node.kind() == "preproc_include" {
            self.visit_include(f, src, node, false);
            return;
        }
        for child in named_children(node) {
            self.visit_inactive(f, src, child);
        }
    }

    fn eval_condition(&mut self, f: &mut Frame, src: &LoadedFile, node: Node) -> i64 {
        match node.kind() {
            "preproc_defined" => {
                let name = named_children(node)
                    .first()
                    .map(|n| src.text(*n).to_string())
                    .unwrap_or_default();
                self.test_macro(f, &name).is_some() as i64
            }
            "identifier" => {
                let name = src.text(node).to_string();
                self.test_macro(f, &name)
                    .and_then(|v| parse_int_literal(v.trim()))
                    .unwrap_or(0)
            }
            "number_literal" => parse_int_literal(src.text(node)).unwrap_or(0),
            "parenthesized_expression" => named_children(node)
                .first()
                .map(|n| self.eval_condition(f, src, *n))
                .unwrap_or(0),
            "unary_expression" => {
                let value = node
                    .child_by_field_name("argument")
                    .map(|a| self.eval_condition(f, src, a))
                    .unwrap_or(0);
                match operator(node) {
                    "!" => (value == 0) as i64,
                    "-" => value.wrapping_neg(),
                    "~" => !value,
                    _ => value,
                }
            }
            "binary_expression" => {
                let left = node
                    .child_by_field_name("left")
                    .map(|n| self.eval_condition(f, src, n))
                    .unwrap_or(0);
                let right = node
                    .child_by_field_name("right")
                    .map(|n| self.eval_condition(f, src, n))
                    .unwrap_or(0);
                binary_op(operator(node), left, right).unwrap_or(0)
            }
            "conditional_expression" => {
                let condition = node
                    .child_by_field_name("condition")
                    .map(|n| self.eval_condition(f, src, n))
                    .unwrap_or(0);
                let branch = if condition != 0 { "consequence" } else { "alternative" };
                node.child_by_field_name(branch)
                    .map(|n| self.eval_condition(f, src, n))
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn visit_include(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, active: bool) {
        let Some(path_node) = node.child_by_field_name("path") else {
            return;
        };
        let raw = src.text(path_node);
        let system = path_node.kind() == "system_lib_string";
        let quoted = system || path_node.kind() == "string_literal";
        let name = if quoted && raw.len() >= 2 {
            &raw[1..raw.len() - 1]
        } else {
            raw
        };
        let target = quoted
            .then(|| self.resolve_include(&src.path, name, system))
            .flatten();
        let mut include = ParsedInclude {
            directive: src.text(node).trim_end().to_string(),
            target_path: target.clone(),
            target_macros: SignificantMacros::new(),
            offset: node.start_byte() as u32,
            name_offset: path_node.start_byte() as u32 + quoted as u32,
            name_length: name.len() as u32,
            system,
            active,
        };
        if active {
            match &target {
                Some(target) => include.target_macros = self.enter_include(f, target),
                None => tracing::debug!("Unresolved include in {}: {}", src.path.display(), raw),
            }
        }
        f.includes.push(include);
    }

    fn resolve_include(&self, includer: &Path, name: &str, system: bool) -> Option<PathBuf> {
        let own_dir = if system {
            None
        } else {
            includer.parent().map(Path::to_path_buf)
        };
        own_dir
            .into_iter()
            .chain(self.request.include_paths.iter().cloned())
            .filter_map(|dir| lexical_normalize(&dir.join(name)))
            .find(|candidate| candidate.is_file())
    }

    /// Walks an included header under the current macro state and returns
    /// the macro context of the variant that was used.
    fn enter_include(&mut self, f: &mut Frame, target: &Path) -> SignificantMacros {
        let previous = self.last_variant.get(target).cloned().unwrap_or_default();
        if self.stack.iter().any(|p| p == target) {
            return previous;
        }
        let file = match self.load(target) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!("Failed to read include {}: {}", target.display(), e);
                return previous;
            }
        };
        let guarded = self.once.contains(target)
            || file
                .guard
                .as_ref()
                .map(|g| self.macros.contains_key(g))
                .unwrap_or(false);
        if guarded {
            return previous;
        }

        let saved_locals = std::mem::take(&mut self.locals);
        let (parsed, touched) = self.walk_file(file, f.linkage);
        self.locals = saved_locals;
        f.touched.extend(touched);

        let macros = parsed.significant_macros.clone();
        self.last_variant.insert(target.to_path_buf(), macros.clone());
        let duplicate = self
            .headers
            .iter()
            .any(|h| h.path == parsed.path && h.significant_macros == macros);
        if !duplicate {
            self.headers.push(parsed);
        }
        macros
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn visit_children(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx) {
        for child in named_children(node) {
            self.visit(f, src, child, ctx);
        }
    }

    fn visit(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx) {
        match node.kind() {
            "comment" => {}
            "preproc_include" => self.visit_include(f, src, node, true),
            "preproc_def" | "preproc_function_def" => self.define_macro(f, src, node),
            "preproc_call" => self.visit_directive(f, src, node),
            "preproc_ifdef" | "preproc_if" => self.visit_conditional(f, src, node, ctx),
            _ if ctx.in_function => self.visit_expr(f, src, node, ctx, &[]),
            "namespace_definition" => self.visit_namespace(f, src, node, ctx),
            "function_definition" => self.visit_function(f, src, node, ctx),
            "declaration" => self.visit_declaration(f, src, node, ctx),
            "field_declaration" => self.visit_field(f, src, node, ctx),
            "type_definition" => self.visit_typedef(f, src, node, ctx),
            "alias_declaration" => self.visit_alias(f, src, node, ctx),
            "class_specifier" | "struct_specifier" | "union_specifier" | "enum_specifier" => {
                self.visit_type(f, src, node, ctx, true);
            }
            "template_declaration" => {
                for child in named_children(node) {
                    if child.kind() != "template_parameter_list" {
                        self.visit(f, src, child, ctx);
                    }
                }
            }
            "linkage_specification" => {
                if let Some(body) = node.child_by_field_name("body") {
                    self.visit(f, src, body, ctx);
                }
            }
            "access_specifier" | "friend_declaration" | "using_declaration"
            | "static_assert_declaration" => {}
            _ => self.visit_children(f, src, node, ctx),
        }
    }

    fn visit_namespace(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx) {
        let mut scope = ctx.scope.clone();
        if let Some(name) = node.child_by_field_name("name") {
            for part in split_scope(src.text(name)) {
                scope.push(part);
                self.declare(&scope, BindingKind::Namespace, None, false, None);
            }
            self.emit(
                f,
                name_node(name),
                self.symbol(scope.clone(), BindingKind::Namespace),
                NameRole::Definition,
                NameSyntax::plain(),
                None,
            );
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.visit_children(f, src, body, &ctx.nested(scope, false));
        }
    }

    /// Visits a type specifier and returns the class or typedef it names.
    fn visit_type(
        &mut self,
        f: &mut Frame,
        src: &LoadedFile,
        node: Node,
        ctx: &Ctx,
        standalone: bool,
    ) -> Option<Vec<String>> {
        match node.kind() {
            "class_specifier" | "struct_specifier" | "union_specifier" => {
                self.visit_class(f, src, node, ctx, standalone, None)
            }
            "enum_specifier" => self.visit_enum(f, src, node, ctx, standalone, None),
            "type_identifier" | "qualified_identifier" | "template_type" => {
                self.type_reference(f, src, node, ctx)
            }
            "type_descriptor" => node
                .child_by_field_name("type")
                .and_then(|t| self.visit_type(f, src, t, ctx, false)),
            _ => None,
        }
    }

    fn type_reference(
        &mut self,
        f: &mut Frame,
        src: &LoadedFile,
        node: Node,
        ctx: &Ctx,
    ) -> Option<Vec<String>> {
        let text = src.text(node);
        let qualified = node.kind() == "qualified_identifier";
        let innermost = name_node(node);
        let (occurrence, arguments) = if innermost.kind() == "template_type" {
            (
                innermost.child_by_field_name("name"),
                innermost.child_by_field_name("arguments"),
            )
        } else {
            (Some(innermost), None)
        };
        if let Some(arguments) = arguments {
            for argument in named_children(arguments) {
                self.visit_expr(f, src, argument, ctx, &[]);
            }
        }

        let parts = split_scope(text);
        let scope: &[String] = if text.trim_start().starts_with("::") {
            &[]
        } else {
            &ctx.scope
        };
        let (primary, entry) = self.symbols.lookup(&parts, scope, Space::Type)?;
        let occurrence = occurrence?;
        let mut symbol = self.symbol(primary.clone(), entry.kind.clone());
        if let Some(arguments) = arguments {
            let args: String = src
                .text(arguments)
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            if let Some(last) = symbol.qualified_name.last_mut() {
                last.push_str(&args);
            }
            symbol.kind = entry.kind.bare();
            symbol.instance_of = Some(primary.clone());
        }
        self.emit(
            f,
            occurrence,
            symbol,
            NameRole::Reference,
            NameSyntax {
                qualified,
                ..NameSyntax::default()
            },
            None,
        );
        Some(primary)
    }

    fn visit_class(
        &mut self,
        f: &mut Frame,
        src: &LoadedFile,
        node: Node,
        ctx: &Ctx,
        standalone: bool,
        typedef_name: Option<String>,
    ) -> Option<Vec<String>> {
        let key = match node.kind() {
            "struct_specifier" => ClassKey::Struct,
            "union_specifier" => ClassKey::Union,
            _ => ClassKey::Class,
        };
        let body = node.child_by_field_name("body");
        let name = node.child_by_field_name("name");

        let qname = match (name, typedef_name) {
            (Some(name), _) => {
                if body.is_none() && !standalone {
                    if let Some(found) = self.type_reference(f, src, name, ctx) {
                        return Some(found);
                    }
                }
                let qname = self.definition_name(ctx, src.text(name));
                let role = if body.is_some() {
                    NameRole::Definition
                } else {
                    NameRole::Declaration
                };
                let kind = BindingKind::Class { key };
                self.declare(&qname, kind.clone(), None, false, None);
                self.emit(
                    f,
                    name_node(name),
                    self.symbol(qname.clone(), kind),
                    role,
                    NameSyntax {
                        qualified: name.kind() == "qualified_identifier",
                        ..NameSyntax::default()
                    },
                    None,
                );
                qname
            }
            (None, Some(typedef_name)) => {
                let mut qname = ctx.scope.clone();
                qname.push(typedef_name);
                self.declare(&qname, BindingKind::Class { key }, None, false, None);
                qname
            }
            (None, None) => {
                // anonymous members belong to the enclosing scope
                if let Some(body) = body {
                    self.visit_children(f, src, body, ctx);
                }
                return None;
            }
        };

        let Some(body) = body else {
            return Some(qname);
        };
        let mut bases = Vec::new();
        for clause in named_children(node) {
            if clause.kind() != "base_class_clause" {
                continue;
            }
            for base in named_children(clause) {
                if matches!(
                    base.kind(),
                    "type_identifier" | "qualified_identifier" | "template_type"
                ) {
                    if let Some(found) = self.type_reference(f, src, base, ctx) {
                        bases.push(found);
                    }
                }
            }
        }
        if !bases.is_empty() {
            self.symbols.bases.insert(qname.clone(), bases);
        }
        self.visit_children(f, src, body, &ctx.nested(qname.clone(), true));
        if f.linkage == Linkage::Cpp && key != ClassKey::Union {
            self.declare_implicit_members(f, &qname, body);
        }
        Some(qname)
    }

    /// Default constructor and destructor the compiler provides when the
    /// class declares none. They get an empty name at the closing brace.
    fn declare_implicit_members(&self, f: &mut Frame, class: &[String], body: Node) {
        let Some(name) = class.last() else {
            return;
        };
        let offset = body.end_byte().saturating_sub(1) as u32;
        for member in [name.clone(), format!("~{}", name)] {
            let mut qname = class.to_vec();
            qname.push(member);
            let user_declared = f
                .names
                .iter()
                .any(|n| n.role != NameRole::Reference && n.target.qualified_name == qname);
            if user_declared {
                continue;
            }
            let mut target = self.symbol(qname, BindingKind::Function { is_virtual: false });
            target.implicit = true;
            f.names.push(ParsedName {
                target,
                offset,
                length: 0,
                role: NameRole::Declaration,
                body_extent: None,
                syntax: NameSyntax::plain(),
            });
        }
    }

    fn visit_enum(
        &mut self,
        f: &mut Frame,
        src: &LoadedFile,
        node: Node,
        ctx: &Ctx,
        standalone: bool,
        typedef_name: Option<String>,
    ) -> Option<Vec<String>> {
        let body = node.child_by_field_name("body");
        let name = node.child_by_field_name("name");
        let scoped = children(node)
            .iter()
            .any(|c| matches!(c.kind(), "class" | "struct"));

        let qname = match (name, typedef_name) {
            (Some(name), _) => {
                if body.is_none() && !standalone {
                    if let Some(found) = self.type_reference(f, src, name, ctx) {
                        return Some(found);
                    }
                }
                let qname = self.definition_name(ctx, src.text(name));
                self.declare(&qname, BindingKind::Enumeration, None, false, None);
                let role = if body.is_some() {
                    NameRole::Definition
                } else {
                    NameRole::Declaration
                };
                self.emit(
                    f,
                    name_node(name),
                    self.symbol(qname.clone(), BindingKind::Enumeration),
                    role,
                    NameSyntax::plain(),
                    None,
                );
                Some(qname)
            }
            (None, Some(typedef_name)) => {
                let mut qname = ctx.scope.clone();
                qname.push(typedef_name);
                self.declare(&qname, BindingKind::Enumeration, None, false, None);
                Some(qname)
            }
            (None, None) => None,
        };

        let Some(body) = body else {
            return qname;
        };
        let enumerator_scope = match (&qname, scoped) {
            (Some(qname), true) => qname.clone(),
            _ => ctx.scope.clone(),
        };
        let mut next: Option<i64> = Some(0);
        for enumerator in named_children(body) {
            if enumerator.kind() != "enumerator" {
                if enumerator.kind() != "comment" {
                    self.visit(f, src, enumerator, ctx);
                }
                continue;
            }
            let Some(name) = enumerator.child_by_field_name("name") else {
                continue;
            };
            let value = match enumerator.child_by_field_name("value") {
                Some(expr) => {
                    self.visit_expr(f, src, expr, ctx, &[]);
                    self.const_eval(src, expr, ctx)
                }
                None => next,
            };
            next = value.and_then(|v| v.checked_add(1));
            let mut enumerator_name = enumerator_scope.clone();
            enumerator_name.push(src.text(name).to_string());
            let kind = BindingKind::Enumerator {
                value: value.map(ConstValue::Known).unwrap_or(ConstValue::Unknown),
            };
            self.declare(&enumerator_name, kind.clone(), None, false, None);
            self.emit(
                f,
                name,
                self.symbol(enumerator_name, kind),
                NameRole::Definition,
                NameSyntax::plain(),
                None,
            );
        }
        qname
    }

    fn visit_typedef(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx) {
        let declarators = children_by_field(node, "declarator");
        let first_name = declarators
            .first()
            .and_then(|d| declarator_shape(*d).name)
            .map(|n| src.text(n).to_string());
        let target = node.child_by_field_name("type").and_then(|t| {
            let anonymous = t.child_by_field_name("name").is_none();
            match t.kind() {
                "class_specifier" | "struct_specifier" | "union_specifier" if anonymous => {
                    self.visit_class(f, src, t, ctx, false, first_name.clone())
                }
                "enum_specifier" if anonymous => {
                    self.visit_enum(f, src, t, ctx, false, first_name.clone())
                }
                _ => self.visit_type(f, src, t, ctx, false),
            }
        });
        for declarator in declarators {
            let Some(name) = declarator_shape(declarator).name else {
                continue;
            };
            let mut qname = ctx.scope.clone();
            qname.push(src.text(name).to_string());
            self.declare(&qname, BindingKind::Typedef, None, false, target.clone());
            self.emit(
                f,
                name,
                self.symbol(qname, BindingKind::Typedef),
                NameRole::Definition,
                NameSyntax::plain(),
                None,
            );
        }
    }

    fn visit_alias(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx) {
        let target = node
            .child_by_field_name("type")
            .and_then(|t| self.visit_type(f, src, t, ctx, false));
        let Some(name) = node.child_by_field_name("name") else {
            return;
        };
        let mut qname = ctx.scope.clone();
        qname.push(src.text(name).to_string());
        self.declare(&qname, BindingKind::Typedef, None, false, target);
        self.emit(
            f,
            name,
            self.symbol(qname, BindingKind::Typedef),
            NameRole::Definition,
            NameSyntax::plain(),
            None,
        );
    }

    fn visit_function(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx) {
        if let Some(return_type) = node.child_by_field_name("type") {
            self.visit_type(f, src, return_type, ctx, false);
        }
        let Some(declarator) = node.child_by_field_name("declarator") else {
            return;
        };
        let Some(function) = declarator_shape(declarator).function else {
            return;
        };
        let Some(name) = function.child_by_field_name("declarator") else {
            return;
        };
        let body = node.child_by_field_name("body");
        let extent = body.map(|b| (function.end_byte() as u32, b.end_byte() as u32));
        let role = if body.is_some() {
            NameRole::Definition
        } else {
            NameRole::Declaration
        };
        let (qname, locals) = self.declare_function(f, src, node, function, name, ctx, role, extent);

        let owner = qname[..qname.len().saturating_sub(1)].to_vec();
        let class = if self.symbols.is_class(&owner) {
            Some(owner.clone())
        } else {
            ctx.class.clone()
        };
        let body_ctx = Ctx {
            scope: owner,
            class,
            in_function: true,
        };
        self.locals.push(locals.into_iter().collect());
        for child in named_children(node) {
            if child.kind() == "field_initializer_list" {
                self.visit_initializers(f, src, child, &body_ctx);
            }
        }
        if let Some(body) = body {
            self.visit_expr(f, src, body, &body_ctx, &[]);
        }
        self.locals.pop();
    }

    /// Declares a function or method and emits its name. Returns the
    /// qualified name and the parameters as locals.
    #[allow(clippy::too_many_arguments)]
    fn declare_function(
        &mut self,
        f: &mut Frame,
        src: &LoadedFile,
        declaration: Node,
        function: Node,
        name: Node,
        ctx: &Ctx,
        role: NameRole,
        body_extent: Option<(u32, u32)>,
    ) -> (Vec<String>, Vec<(String, Option<Vec<String>>)>) {
        let qname = self.definition_name(ctx, src.text(name));
        let owner = &qname[..qname.len().saturating_sub(1)];
        let last = qname.last().cloned().unwrap_or_default();
        let is_virtual = has_keyword(src, declaration, "virtual")
            || children(function)
                .iter()
                .any(|c| c.kind() == "virtual_specifier")
            || self.symbols.inherits_virtual(owner, &last);

        let (params, variadic, locals) = match function.child_by_field_name("parameters") {
            Some(list) => self.visit_params(f, src, list, ctx),
            None => (Vec::new(), false, Vec::new()),
        };
        let kind = BindingKind::Function { is_virtual };
        self.declare(&qname, kind.clone(), Some(params), variadic, None);
        self.emit(
            f,
            name_node(name),
            self.symbol(qname.clone(), kind),
            role,
            NameSyntax {
                qualified: name.kind() == "qualified_identifier",
                ..NameSyntax::default()
            },
            body_extent,
        );
        (qname, locals)
    }

    #[allow(clippy::type_complexity)]
    fn visit_params(
        &mut self,
        f: &mut Frame,
        src: &LoadedFile,
        list: Node,
        ctx: &Ctx,
    ) -> (Vec<ParamPassing>, bool, Vec<(String, Option<Vec<String>>)>) {
        let mut params = Vec::new();
        let mut variadic = false;
        let mut locals = Vec::new();
        for param in named_children(list) {
            match param.kind() {
                "parameter_declaration" | "optional_parameter_declaration" => {}
                "variadic_parameter_declaration" | "variadic_parameter" => {
                    variadic = true;
                    continue;
                }
                _ => continue,
            }
            let param_type = param
                .child_by_field_name("type")
                .and_then(|t| self.visit_type(f, src, t, ctx, false));
            if let Some(default) = param.child_by_field_name("default_value") {
                self.visit_expr(f, src, default, ctx, &[]);
            }
            let declarator = param.child_by_field_name("declarator");
            let is_void = declarator.is_none()
                && param
                    .child_by_field_name("type")
                    .map(|t| src.text(t) == "void")
                    .unwrap_or(false);
            if is_void {
                continue;
            }
            let base_const = has_keyword(src, param, "const");
            let shape = declarator.map(declarator_shape).unwrap_or_default();
            if let Some(name) = shape.name {
                locals.push((src.text(name).to_string(), param_type));
            }
            params.push(param_passing(&shape, base_const));
        }
        (params, variadic, locals)
    }

    fn visit_initializers(&mut self, f: &mut Frame, src: &LoadedFile, list: Node, ctx: &Ctx) {
        for initializer in named_children(list) {
            for part in named_children(initializer) {
                match part.kind() {
                    "field_identifier" => {
                        let name = src.text(part).to_string();
                        let target = ctx
                            .class
                            .as_ref()
                            .and_then(|c| self.symbols.member(c, &name, 0));
                        if let Some((qname, entry)) = target {
                            let syntax = NameSyntax {
                                access: vec![AccessStep::AssignTarget],
                                ..NameSyntax::default()
                            };
                            let symbol = self.symbol(qname, entry.kind);
                            self.emit(f, part, symbol, NameRole::Reference, syntax, None);
                        }
                    }
                    "type_identifier" | "qualified_identifier" | "template_type" => {
                        self.type_reference(f, src, part, ctx);
                    }
                    _ => self.visit_expr(f, src, part, ctx, &[]),
                }
            }
        }
    }

    fn visit_declaration(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx) {
        let declarators = children_by_field(node, "declarator");
        let var_type = node
            .child_by_field_name("type")
            .and_then(|t| self.visit_type(f, src, t, ctx, declarators.is_empty()));
        let is_extern = has_keyword(src, node, "extern");
        let base_const = has_keyword(src, node, "const") || has_keyword(src, node, "constexpr");
        let in_class = ctx.class.as_ref() == Some(&ctx.scope) && !ctx.scope.is_empty();

        for declarator in declarators {
            let (declarator, value) = if declarator.kind() == "init_declarator" {
                (
                    declarator.child_by_field_name("declarator"),
                    declarator.child_by_field_name("value"),
                )
            } else {
                (Some(declarator), None)
            };
            let Some(declarator) = declarator else {
                continue;
            };
            let shape = declarator_shape(declarator);
            let Some(name) = shape.name else {
                continue;
            };
            if let Some(function) = shape.function {
                self.declare_function(f, src, node, function, name, ctx, NameRole::Declaration, None);
                continue;
            }
            let steps: Vec<AccessStep> = if shape.reference {
                vec![AccessStep::BindReference {
                    is_const: base_const,
                }]
            } else {
                Vec::new()
            };
            if ctx.in_function {
                if let Some(value) = value {
                    self.visit_expr(f, src, value, ctx, &steps);
                }
                self.add_local(src.text(name), var_type.clone());
                continue;
            }

            let qname = self.definition_name(ctx, src.text(name));
            let existing_field = self
                .symbols
                .get(&qname, Space::Value)
                .map(|e| e.kind == BindingKind::Field)
                .unwrap_or(false);
            let kind = if in_class || existing_field {
                BindingKind::Field
            } else {
                let constant = if base_const && shape.levels.is_empty() {
                    value.and_then(|v| self.const_eval(src, v, ctx))
                } else {
                    None
                };
                BindingKind::Variable {
                    value: constant.map(ConstValue::Known).unwrap_or(ConstValue::Unknown),
                }
            };
            let role = if is_extern && value.is_none() {
                NameRole::Declaration
            } else {
                NameRole::Definition
            };
            self.declare(&qname, kind.clone(), None, false, var_type.clone());
            self.emit(
                f,
                name_node(name),
                self.symbol(qname, kind),
                role,
                NameSyntax {
                    qualified: name.kind() == "qualified_identifier",
                    ..NameSyntax::default()
                },
                None,
            );
            if let Some(value) = value {
                self.visit_expr(f, src, value, ctx, &steps);
            }
        }
    }

    fn visit_field(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx) {
        let declarators = children_by_field(node, "declarator");
        let var_type = node
            .child_by_field_name("type")
            .and_then(|t| self.visit_type(f, src, t, ctx, declarators.is_empty()));
        let is_static = has_keyword(src, node, "static");
        for declarator in declarators {
            let shape = declarator_shape(declarator);
            let Some(name) = shape.name else {
                continue;
            };
            if let Some(function) = shape.function {
                self.declare_function(f, src, node, function, name, ctx, NameRole::Declaration, None);
                continue;
            }
            let mut qname = ctx.scope.clone();
            qname.push(src.text(name).to_string());
            let role = if is_static {
                NameRole::Declaration
            } else {
                NameRole::Definition
            };
            self.declare(&qname, BindingKind::Field, None, false, var_type.clone());
            self.emit(
                f,
                name,
                self.symbol(qname, BindingKind::Field),
                role,
                NameSyntax::plain(),
                None,
            );
        }
        if let Some(default) = node.child_by_field_name("default_value") {
            self.visit_expr(f, src, default, ctx, &[]);
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// `chain` holds the wrappers around `node`, innermost first.
    fn visit_expr(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx, chain: &[AccessStep]) {
        match node.kind() {
            "comment" | "string_literal" | "raw_string_literal" | "concatenated_string"
            | "number_literal" | "char_literal" | "true" | "false" | "null" | "nullptr"
            | "this" | "primitive_type" | "field_identifier" | "statement_identifier"
            | "sized_type_specifier" => {}
            "preproc_ifdef" | "preproc_if" | "preproc_include" | "preproc_def"
            | "preproc_function_def" | "preproc_call" => self.visit(f, src, node, ctx),
            "declaration" => self.visit_declaration(f, src, node, ctx),
            "identifier" => {
                self.value_reference(f, src, node, ctx, chain, false);
            }
            "qualified_identifier" => {
                self.qualified_reference(f, src, node, ctx, chain, false);
            }
            "type_identifier" | "template_type" | "type_descriptor" | "class_specifier"
            | "struct_specifier" | "union_specifier" | "enum_specifier" => {
                self.visit_type(f, src, node, ctx, false);
            }
            "field_expression" => {
                self.member_reference(f, src, node, ctx, chain, false);
            }
            "call_expression" => self.visit_call(f, src, node, ctx),
            "assignment_expression" => {
                let step = if operator(node) == "=" {
                    AccessStep::AssignTarget
                } else {
                    AccessStep::CompoundAssignTarget
                };
                if let Some(left) = node.child_by_field_name("left") {
                    self.visit_expr(f, src, left, ctx, &[step]);
                }
                if let Some(right) = node.child_by_field_name("right") {
                    self.visit_expr(f, src, right, ctx, &[]);
                }
            }
            "update_expression" => {
                if let Some(argument) = node.child_by_field_name("argument") {
                    self.visit_expr(f, src, argument, ctx, &[AccessStep::IncDec]);
                }
            }
            "pointer_expression" => {
                let step = if operator(node) == "&" {
                    AccessStep::AddressOf
                } else {
                    AccessStep::Deref
                };
                if let Some(argument) = node.child_by_field_name("argument") {
                    self.visit_expr(f, src, argument, ctx, &wrap(step, chain));
                }
            }
            "subscript_expression" => {
                let argument = node.child_by_field_name("argument");
                for child in named_children(node) {
                    if Some(child.id()) == argument.map(|a| a.id()) {
                        self.visit_expr(f, src, child, ctx, &wrap(AccessStep::Subscript, chain));
                    } else {
                        self.visit_expr(f, src, child, ctx, &[]);
                    }
                }
            }
            "parenthesized_expression" => {
                for child in named_children(node) {
                    self.visit_expr(f, src, child, ctx, chain);
                }
            }
            "conditional_expression" => {
                if let Some(condition) = node.child_by_field_name("condition") {
                    self.visit_expr(f, src, condition, ctx, &[]);
                }
                for branch in ["consequence", "alternative"] {
                    if let Some(branch) = node.child_by_field_name(branch) {
                        self.visit_expr(f, src, branch, ctx, chain);
                    }
                }
            }
            "comma_expression" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.visit_expr(f, src, left, ctx, &[]);
                }
                if let Some(right) = node.child_by_field_name("right") {
                    self.visit_expr(f, src, right, ctx, chain);
                }
            }
            "for_range_loop" => {
                let var_type = node
                    .child_by_field_name("type")
                    .and_then(|t| self.visit_type(f, src, t, ctx, false));
                if let Some(right) = node.child_by_field_name("right") {
                    self.visit_expr(f, src, right, ctx, &[]);
                }
                if let Some(name) = node
                    .child_by_field_name("declarator")
                    .and_then(|d| declarator_shape(d).name)
                {
                    self.add_local(src.text(name), var_type);
                }
                if let Some(body) = node.child_by_field_name("body") {
                    self.visit_expr(f, src, body, ctx, &[]);
                }
            }
            "lambda_expression" => {
                let mut locals = HashMap::new();
                if let Some(list) = node
                    .child_by_field_name("declarator")
                    .and_then(|d| d.child_by_field_name("parameters"))
                {
                    for param in named_children(list) {
                        if let Some(name) = param
                            .child_by_field_name("declarator")
                            .and_then(|d| declarator_shape(d).name)
                        {
                            locals.insert(src.text(name).to_string(), None);
                        }
                    }
                }
                self.locals.push(locals);
                if let Some(body) = node.child_by_field_name("body") {
                    self.visit_expr(f, src, body, ctx, &[]);
                }
                self.locals.pop();
            }
            _ => {
                for child in named_children(node) {
                    self.visit_expr(f, src, child, ctx, &[]);
                }
            }
        }
    }

    fn visit_call(&mut self, f: &mut Frame, src: &LoadedFile, node: Node, ctx: &Ctx) {
        let callee = node.child_by_field_name("function").and_then(|c| match c.kind() {
            "identifier" => self.value_reference(f, src, c, ctx, &[], true),
            "qualified_identifier" => self.qualified_reference(f, src, c, ctx, &[], true),
            "field_expression" => self.member_reference(f, src, c, ctx, &[], true),
            "template_function" => {
                if let Some(arguments) = c.child_by_field_name("arguments") {
                    for argument in named_children(arguments) {
                        self.visit_expr(f, src, argument, ctx, &[]);
                    }
                }
                let name = c.child_by_field_name("name")?;
                match name.kind() {
                    "identifier" => self.value_reference(f, src, name, ctx, &[], true),
                    _ => self.qualified_reference(f, src, name, ctx, &[], true),
                }
            }
            _ => {
                self.visit_expr(f, src, c, ctx, &[]);
                None
            }
        });
        let (params, variadic) = match callee {
            Some(Entry {
                params: Some(params),
                variadic,
                ..
            }) => (Some(params), variadic),
            _ => (None, false),
        };
        let Some(arguments) = node.child_by_field_name("arguments") else {
            return;
        };
        let arguments = named_children(arguments)
            .into_iter()
            .filter(|a| a.kind() != "comment");
        for (i, argument) in arguments.enumerate() {
            let param = match &params {
                Some(params) => match params.get(i) {
                    Some(param) => param.clone(),
                    None if variadic => ParamPassing::Value,
                    None => ParamPassing::Unknown,
                },
                None => ParamPassing::Unknown,
            };
            self.visit_expr(f, src, argument, ctx, &[AccessStep::Argument { param }]);
        }
    }

    fn value_reference(
        &mut self,
        f: &mut Frame,
        src: &LoadedFile,
        node: Node,
        ctx: &Ctx,
        chain: &[AccessStep],
        call: bool,
    ) -> Option<Entry> {
        let name = src.text(node);
        if self.local_type(name).is_some() {
            return None;
        }
        let parts = [name.to_string()];
        let (qname, entry) = ctx
            .class
            .as_ref()
            .and_then(|c| self.symbols.member(c, name, 0))
            .or_else(|| self.symbols.lookup(&parts, &ctx.scope, Space::Value))
            .or_else(|| self.symbols.lookup(&parts, &ctx.scope, Space::Type))?;
        let symbol = self.symbol(qname, entry.kind.clone());
        let syntax = NameSyntax {
            qualified: false,
            call,
            access: chain.to_vec(),
        };
        self.emit(f, node, symbol, NameRole::Reference, syntax, None);
        Some(entry)
    }

    fn qualified_reference(
        &mut self,
        f: &mut Frame,
        src: &LoadedFile,
        node: Node,
        ctx: &Ctx,
        chain: &[AccessStep],
        call: bool,
    ) -> Option<Entry> {
        let text = src.text(node);
        let parts = split_scope(text);
        let scope: &[String] = if text.trim_start().starts_with("::") {
            &[]
        } else {
            &ctx.scope
        };
        if let (Some(scope_node), Some((owner, owner_entry))) = (
            node.child_by_field_name("scope"),
            self.symbols
                .lookup(&parts[..parts.len().saturating_sub(1)], scope, Space::Type),
        ) {
            // only a single scope component lines up with the owner's name
            let single = parts.len() == 2
                && matches!(scope_node.kind(), "namespace_identifier" | "type_identifier");
            if single {
                let symbol = self.symbol(owner, owner_entry.kind);
                self.emit(f, scope_node, symbol, NameRole::Reference, NameSyntax::plain(), None);
            }
        }
        let (qname, entry) = self
            .symbols
            .lookup(&parts, scope, Space::Value)
            .or_else(|| self.symbols.lookup(&parts, scope, Space::Type))?;
        let symbol = self.symbol(qname, entry.kind.clone());
        let syntax = NameSyntax {
            qualified: true,
            call,
            access: chain.to_vec(),
        };
        self.emit(f, name_node(node), symbol, NameRole::Reference, syntax, None);
        Some(entry)
    }

    fn member_reference(
        &mut self,
        f: &mut Frame,
        src: &LoadedFile,
        node: Node,
        ctx: &Ctx,
        chain: &[AccessStep],
        call: bool,
    ) -> Option<Entry> {
        let argument = node.child_by_field_name("argument");
        let arrow = operator(node) == "->";
        let mut found = None;
        if let (Some(argument), Some(field)) = (argument, node.child_by_field_name("field")) {
            let field_name = src.text(name_node(field)).to_string();
            let target = self
                .expr_class(src, argument, ctx)
                .and_then(|class| self.symbols.member(&class, &field_name, 0))
                .or_else(|| self.symbols.unique_member(&field_name));
            if let Some((qname, entry)) = target {
                let symbol = self.symbol(qname, entry.kind.clone());
                let syntax = NameSyntax {
                    qualified: field.kind().starts_with("qualified"),
                    call,
                    access: chain.to_vec(),
                };
                self.emit(f, name_node(field), symbol, NameRole::Reference, syntax, None);
                found = Some(entry);
            }
        }
        if let Some(argument) = argument {
            let mut object = if arrow {
                vec![AccessStep::Deref, AccessStep::MemberOf]
            } else {
                vec![AccessStep::MemberOf]
            };
            object.extend_from_slice(chain);
            self.visit_expr(f, src, argument, ctx, &object);
        }
        found
    }

    /// Class of the object an expression denotes, when it can be told from
    /// declarations alone.
    fn expr_class(&self, src: &LoadedFile, node: Node, ctx: &Ctx) -> Option<Vec<String>> {
        let class = match node.kind() {
            "this" => ctx.class.clone(),
            "identifier" => {
                let name = src.text(node);
                match self.local_type(name) {
                    Some(local) => local,
                    None => ctx
                        .class
                        .as_ref()
                        .and_then(|c| self.symbols.member(c, name, 0))
                        .or_else(|| {
                            self.symbols
                                .lookup(&[name.to_string()], &ctx.scope, Space::Value)
                        })
                        .and_then(|(_, e)| e.var_type),
                }
            }
            "qualified_identifier" => self
                .symbols
                .lookup(&split_scope(src.text(node)), &ctx.scope, Space::Value)
                .and_then(|(_, e)| e.var_type),
            "field_expression" => {
                let owner = self.expr_class(src, node.child_by_field_name("argument")?, ctx)?;
                let field = node.child_by_field_name("field")?;
                self.symbols
                    .member(&owner, src.text(name_node(field)), 0)
                    .and_then(|(_, e)| e.var_type)
            }
            "parenthesized_expression" => {
                let inner = named_children(node).into_iter().next()?;
                self.expr_class(src, inner, ctx)
            }
            "pointer_expression" | "subscript_expression" => {
                self.expr_class(src, node.child_by_field_name("argument")?, ctx)
            }
            _ => None,
        }?;
        Some(self.symbols.resolve_class(class))
    }

    fn const_eval(&self, src: &LoadedFile, node: Node, ctx: &Ctx) -> Option<i64> {
        match node.kind() {
            "number_literal" => parse_int_literal(src.text(node)),
            "char_literal" => {
                let inner = src.text(node).trim_matches('\'');
                let mut chars = inner.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c as i64),
                    _ => None,
                }
            }
            "parenthesized_expression" => named_children(node)
                .into_iter()
                .next()
                .and_then(|n| self.const_eval(src, n, ctx)),
            "unary_expression" => {
                let value = self.const_eval(src, node.child_by_field_name("argument")?, ctx)?;
                match operator(node) {
                    "-" => value.checked_neg(),
                    "+" => Some(value),
                    "~" => Some(!value),
                    "!" => Some((value == 0) as i64),
                    _ => None,
                }
            }
            "binary_expression" => {
                let left = self.const_eval(src, node.child_by_field_name("left")?, ctx)?;
                let right = self.const_eval(src, node.child_by_field_name("right")?, ctx)?;
                binary_op(operator(node), left, right)
            }
            "identifier" | "qualified_identifier" => {
                let (_, entry) =
                    self.symbols
                        .lookup(&split_scope(src.text(node)), &ctx.scope, Space::Value)?;
                match entry.kind.value()? {
                    ConstValue::Known(value) => Some(value),
                    ConstValue::Unknown => None,
                }
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn declare(
        &mut self,
        qname: &[String],
        kind: BindingKind,
        params: Option<Vec<ParamPassing>>,
        variadic: bool,
        var_type: Option<Vec<String>>,
    ) {
        self.symbols.declare(
            qname,
            Entry {
                kind,
                params,
                variadic,
                var_type,
            },
        );
    }

    /// Qualified name for a declarator name written in `ctx`; an explicit
    /// qualifier is resolved against the enclosing scopes.
    fn definition_name(&self, ctx: &Ctx, text: &str) -> Vec<String> {
        let parts = split_scope(text);
        let Some((last, owner)) = parts.split_last() else {
            return ctx.scope.clone();
        };
        let mut qname = if owner.is_empty() {
            ctx.scope.clone()
        } else if text.trim_start().starts_with("::") {
            owner.to_vec()
        } else {
            self.symbols
                .lookup(owner, &ctx.scope, Space::Type)
                .map(|(q, _)| q)
                .unwrap_or_else(|| {
                    let mut q = ctx.scope.clone();
                    q.extend_from_slice(owner);
                    q
                })
        };
        qname.push(last.clone());
        qname
    }

    fn add_local(&mut self, name: &str, var_type: Option<Vec<String>>) {
        if let Some(scope) = self.locals.last_mut() {
            scope.insert(name.to_string(), var_type);
        }
    }

    /// `Some` when `name` is a local or parameter of the current function.
    fn local_type(&self, name: &str) -> Option<Option<Vec<String>>> {
        self.locals
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).cloned())
    }

    fn symbol(&self, qualified_name: Vec<String>, kind: BindingKind) -> SymbolRef {
        SymbolRef::new(qualified_name, kind, self.linkage)
    }

    fn emit(
        &self,
        f: &mut Frame,
        node: Node,
        target: SymbolRef,
        role: NameRole,
        syntax: NameSyntax,
        body_extent: Option<(u32, u32)>,
    ) {
        if target.qualified_name.is_empty() {
            return;
        }
        f.names.push(ParsedName {
            target,
            offset: node.start_byte() as u32,
            length: (node.end_byte() - node.start_byte()) as u32,
            role,
            body_extent,
            syntax,
        });
    }
}

fn named_children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

fn children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

fn children_by_field<'t>(node: Node<'t>, field: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children_by_field_name(field, &mut cursor).collect()
}

fn operator(node: Node) -> &'static str {
    node.child_by_field_name("operator")
        .map(|o| o.kind())
        .unwrap_or("")
}

fn wrap(step: AccessStep, chain: &[AccessStep]) -> Vec<AccessStep> {
    let mut steps = Vec::with_capacity(chain.len() + 1);
    steps.push(step);
    steps.extend_from_slice(chain);
    steps
}

fn is_negated(node: Node) -> bool {
    children(node)
        .first()
        .map(|c| matches!(c.kind(), "#ifndef" | "#elifndef"))
        .unwrap_or(false)
}

/// Items of a conditional branch, without its condition and alternative.
fn branch_items(node: Node) -> Vec<Node> {
    let skip: Vec<usize> = ["name", "condition", "alternative"]
        .into_iter()
        .filter_map(|field| node.child_by_field_name(field))
        .map(|n| n.id())
        .collect();
    named_children(node)
        .into_iter()
        .filter(|n| !skip.contains(&n.id()))
        .collect()
}

fn include_guard(root: Node, source: &str) -> Option<String> {
    let items: Vec<Node> = named_children(root)
        .into_iter()
        .filter(|n| n.kind() != "comment")
        .collect();
    let [only] = items.as_slice() else {
        return None;
    };
    if only.kind() != "preproc_ifdef"
        || !is_negated(*only)
        || only.child_by_field_name("alternative").is_some()
    {
        return None;
    }
    let text = |n: Node| source.get(n.start_byte()..n.end_byte()).unwrap_or("");
    let guard = text(only.child_by_field_name("name")?);
    let first = branch_items(*only)
        .into_iter()
        .find(|n| n.kind() != "comment")?;
    let defined = text(first.child_by_field_name("name")?);
    (first.kind() == "preproc_def" && defined == guard).then(|| guard.to_string())
}

/// Innermost name of a possibly qualified or templated name.
fn name_node(node: Node) -> Node {
    let mut current = node;
    loop {
        let next = match current.kind() {
            "qualified_identifier" | "template_function" | "template_method"
            | "qualified_field_identifier" | "qualified_type_identifier" => {
                current.child_by_field_name("name")
            }
            "nested_namespace_specifier" => named_children(current).last().copied(),
            _ => None,
        };
        match next {
            Some(next) => current = next,
            None => return current,
        }
    }
}

fn declarator_shape(node: Node) -> DeclShape {
    let mut shape = DeclShape::default();
    let mut current = node;
    loop {
        let kind = current.kind();
        let kind = kind.strip_prefix("abstract_").unwrap_or(kind);
        match kind {
            "identifier" | "field_identifier" | "type_identifier" | "qualified_identifier"
            | "destructor_name" | "operator_name" | "template_function" => {
                shape.name = Some(current);
                return shape;
            }
            "pointer_declarator" => {
                if shape.function.is_some() {
                    // pointer to function: the name is a variable
                    shape.function = None;
                }
                shape.levels.push(
                    children(current)
                        .iter()
                        .any(|c| c.kind() == "type_qualifier" && c.child_count() == 1 && is_const_qualifier(*c)),
                );
            }
            "array_declarator" => shape.levels.push(false),
            "reference_declarator" => shape.reference = true,
            "function_declarator" => shape.function = Some(current),
            "init_declarator" | "parenthesized_declarator" | "attributed_declarator" => {}
            _ => return shape,
        }
        match current
            .child_by_field_name("declarator")
            .or_else(|| named_children(current).into_iter().rev().find(|c| c.kind() != "type_qualifier"))
        {
            Some(next) => current = next,
            None => return shape,
        }
    }
}

fn is_const_qualifier(node: Node) -> bool {
    children(node).iter().any(|c| c.kind() == "const")
}

fn param_passing(shape: &DeclShape, base_const: bool) -> ParamPassing {
    if shape.reference {
        return ParamPassing::Reference {
            is_const: base_const && shape.levels.is_empty(),
        };
    }
    if shape.levels.is_empty() {
        return ParamPassing::Value;
    }
    // Qualifiers on a pointer level apply to what the next level inwards
    // points at; the innermost pointee carries the base type's qualifiers.
    let inner_first: Vec<bool> = shape.levels.iter().rev().copied().collect();
    let levels = (0..inner_first.len())
        .map(|i| inner_first.get(i + 1).copied().unwrap_or(base_const))
        .collect();
    ParamPassing::Pointer { levels }
}

fn has_keyword(src: &LoadedFile, node: Node, keyword: &str) -> bool {
    children(node).iter().any(|c| {
        c.kind() == keyword
            || (matches!(
                c.kind(),
                "storage_class_specifier" | "type_qualifier" | "virtual_function_specifier" | "virtual"
            ) && src.text(*c) == keyword)
    })
}

/// Splits `a::b<int>::c` into `["a", "b", "c"]`.
fn split_scope(text: &str) -> Vec<String> {
    strip_template_args(text)
        .split("::")
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

fn strip_template_args(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if depth == 0 && rest.starts_with("operator") {
            out.push_str(rest);
            break;
        }
        match c {
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

fn parse_int_literal(text: &str) -> Option<i64> {
    let cleaned: String = text.chars().filter(|c| *c != '\'').collect();
    let digits = cleaned.trim_end_matches(['u', 'U', 'l', 'L']);
    let (radix, body) = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, hex)
    } else if let Some(bin) = digits
        .strip_prefix("0b")
        .or_else(|| digits.strip_prefix("0B"))
    {
        (2, bin)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    u64::from_str_radix(body, radix).ok().map(|v| v as i64)
}

fn binary_op(op: &str, left: i64, right: i64) -> Option<i64> {
    Some(match op {
        "+" => left.checked_add(right)?,
        "-" => left.checked_sub(right)?,
        "*" => left.checked_mul(right)?,
        "/" => left.checked_div(right)?,
        "%" => left.checked_rem(right)?,
        "<<" => left.checked_shl(u32::try_from(right).ok()?)?,
        ">>" => left.checked_shr(u32::try_from(right).ok()?)?,
        "&" => left & right,
        "|" => left | right,
        "^" => left ^ right,
        "&&" => (left != 0 && right != 0) as i64,
        "||" => (left != 0 || right != 0) as i64,
        "==" => (left == right) as i64,
        "!=" => (left != right) as i64,
        "<" => (left < right) as i64,
        ">" => (left > right) as i64,
        "<=" => (left <= right) as i64,
        ">=" => (left >= right) as i64,
        _ => return None,
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    lexical_normalize(&joined)
        .ok_or_else(|| IndexerError::UnresolvableLocation(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::access::access_flags;
    use tempfile::TempDir;

    fn parse_with(dir: &TempDir, file: &str, source: &str) -> Vec<ParsedFile> {
        let path = dir.path().join(file);
        std::fs::write(&path, source).unwrap();
        TreeSitterFrontend::new()
            .parse(&ParseRequest::new(&path))
            .unwrap()
    }

    fn parse(file: &str, source: &str) -> Vec<ParsedFile> {
        let dir = TempDir::new().unwrap();
        parse_with(&dir, file, source)
    }

    fn find<'a>(file: &'a ParsedFile, qualified: &str, role: NameRole) -> Vec<&'a ParsedName> {
        file.names
            .iter()
            .filter(|n| n.target.qualified_name.join("::") == qualified && n.role == role)
            .collect()
    }

    fn flags(file: &ParsedFile, name: &ParsedName) -> (bool, bool) {
        access_flags(name.role, &name.syntax.access, file.linkage)
    }

    #[test]
    fn test_function_body_references() {
        let source = "int var;\nvoid func(void);\nint main() {\n  func();\n  var = 1;\n  return 0;\n}\n";
        let files = parse("main.c", source);
        assert_eq!(files.len(), 1);
        let unit = &files[0];
        assert_eq!(unit.linkage, Linkage::C);

        let main = find(unit, "main", NameRole::Definition);
        assert_eq!(main.len(), 1);
        let (start, end) = main[0].body_extent.unwrap();

        let call = find(unit, "func", NameRole::Reference);
        assert_eq!(call.len(), 1);
        assert!(call[0].syntax.call);
        assert!(start <= call[0].offset && call[0].offset < end);

        let write = find(unit, "var", NameRole::Reference);
        assert_eq!(write.len(), 1);
        assert_eq!(flags(unit, write[0]), (false, true));
        assert!(start <= write[0].offset && write[0].offset < end);

        assert_eq!(find(unit, "var", NameRole::Definition).len(), 1);
        assert_eq!(find(unit, "func", NameRole::Declaration).len(), 1);
    }

    #[test]
    fn test_locals_and_parameters_are_skipped() {
        let source = "int g;\nint f(int p) {\n  int local = p;\n  local++;\n  return g + local;\n}\n";
        let files = parse("locals.c", source);
        let unit = &files[0];
        assert!(unit
            .names
            .iter()
            .all(|n| !matches!(n.target.qualified_name[0].as_str(), "p" | "local")));
        assert_eq!(find(unit, "g", NameRole::Reference).len(), 1);
    }

    #[test]
    fn test_header_variants_follow_macro_context() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("h.h"),
            "#ifdef X\nvoid foo();\n#else\nvoid bar();\n#endif\n",
        )
        .unwrap();
        let files = parse_with(
            &dir,
            "main.c",
            "#define X\n#include \"h.h\"\n#undef X\n#include \"h.h\"\n#define X\n#include \"h.h\"\n",
        );
        assert_eq!(files.len(), 3);
        let unit = &files[0];
        let with_x = SignificantMacros::new().defined("X", "");
        let without_x = SignificantMacros::new().undefined("X");
        let contexts: Vec<&SignificantMacros> =
            unit.includes.iter().map(|i| &i.target_macros).collect();
        assert_eq!(contexts, vec![&with_x, &without_x, &with_x]);
        assert!(unit.includes.iter().all(|i| i.active && i.target_path.is_some()));

        let variant = |macros: &SignificantMacros| {
            files[1..]
                .iter()
                .find(|f| &f.significant_macros == macros)
                .unwrap()
        };
        assert_eq!(find(variant(&with_x), "foo", NameRole::Declaration).len(), 1);
        assert!(find(variant(&with_x), "bar", NameRole::Declaration).is_empty());
        assert_eq!(find(variant(&without_x), "bar", NameRole::Declaration).len(), 1);

        let defined: Vec<&MacroRecord> = unit.macros.iter().filter(|m| m.is_definition()).collect();
        assert_eq!(defined.len(), 2);
        assert_eq!(unit.macros.len(), 3);
    }

    #[test]
    fn test_include_guard_is_not_significant() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("g.h"),
            "#ifndef G_H\n#define G_H\nint shared;\n#endif\n",
        )
        .unwrap();
        let files = parse_with(&dir, "a.c", "#include \"g.h\"\n#include \"g.h\"\n");
        assert_eq!(files.len(), 2);
        assert!(files[1].significant_macros.is_empty());
        assert_eq!(files[0].includes.len(), 2);
        assert!(files[0].includes.iter().all(|i| i.target_macros.is_empty()));
    }

    #[test]
    fn test_inactive_and_unresolved_includes() {
        let files = parse(
            "a.c",
            "#ifdef NOPE\n#include \"gone.h\"\n#endif\n#include <missing_header.h>\n",
        );
        let includes = &files[0].includes;
        assert_eq!(includes.len(), 2);
        assert!(!includes[0].active);
        assert!(includes[1].active);
        assert!(includes[1].system);
        assert!(includes[1].target_path.is_none());
        assert_eq!(
            files[0].significant_macros,
            SignificantMacros::new().undefined("NOPE")
        );
    }

    #[test]
    fn test_guard_defined_by_includer_skips_header() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("h.h"),
            "#ifndef H_GUARD\n#define H_GUARD\nint from_header;\n#endif\n",
        )
        .unwrap();
        let files = parse_with(
            &dir,
            "a.cpp",
            "#define H_GUARD\n#include \"h.h\"\n#ifdef OTHER\n#include \"h.h\"\n#endif\n",
        );
        assert_eq!(files.len(), 1);
        let includes = &files[0].includes;
        assert_eq!(includes.len(), 2);
        assert!(includes[0].active);
        assert!(includes[0].target_path.is_some());
        assert!(includes[0].target_macros.is_empty());
        assert!(!includes[1].active);
        assert!(find(&files[0], "from_header", NameRole::Definition).is_empty());
    }

    #[test]
    fn test_enumerator_values() {
        let files = parse("e.c", "enum Color { RED, GREEN = 5, BLUE };\n");
        let unit = &files[0];
        let value = |name: &str| {
            find(unit, name, NameRole::Definition)[0]
                .target
                .kind
                .value()
        };
        assert_eq!(value("RED"), Some(ConstValue::Known(0)));
        assert_eq!(value("GREEN"), Some(ConstValue::Known(5)));
        assert_eq!(value("BLUE"), Some(ConstValue::Known(6)));
        assert_eq!(find(unit, "Color", NameRole::Definition).len(), 1);
    }

    #[test]
    fn test_extern_variable_is_declaration() {
        let files = parse("v.c", "extern int counter;\nint total = 3;\n");
        let unit = &files[0];
        assert_eq!(find(unit, "counter", NameRole::Declaration).len(), 1);
        assert_eq!(find(unit, "total", NameRole::Definition).len(), 1);
    }

    #[test]
    fn test_classes_methods_and_virtual_calls() {
        let source = r#"
namespace ns {
class Base {
public:
    virtual void run();
    int count;
};
class Derived : public Base {
public:
    void run() override;
};
}
void use(ns::Base* b) {
    b->run();
    b->count = 2;
}
"#;
        let files = parse("c.cpp", source);
        let unit = &files[0];
        assert_eq!(unit.linkage, Linkage::Cpp);
        assert_eq!(find(unit, "ns", NameRole::Definition).len(), 1);
        assert_eq!(find(unit, "ns::Base", NameRole::Definition).len(), 1);
        let run = find(unit, "ns::Base::run", NameRole::Declaration);
        assert_eq!(run.len(), 1);
        assert!(run[0].target.kind.is_virtual());
        let derived_run = find(unit, "ns::Derived::run", NameRole::Declaration);
        assert!(derived_run[0].target.kind.is_virtual());

        // base class reference from the derived class
        assert!(!find(unit, "ns::Base", NameRole::Reference).is_empty());

        let call = find(unit, "ns::Base::run", NameRole::Reference);
        assert_eq!(call.len(), 1);
        assert!(!call[0].syntax.qualified);
        let field = find(unit, "ns::Base::count", NameRole::Reference);
        assert_eq!(field.len(), 1);
        // writing through a pointer writes the member, not the pointer
        assert_eq!(flags(unit, field[0]), (false, true));
    }

    #[test]
    fn test_implicit_special_members() {
        let source = "struct Plain { int x; };\nclass Owned {\npublic:\n    Owned();\n    ~Owned();\n};\nunion U { int i; };\n";
        let files = parse("s.cpp", source);
        let unit = &files[0];

        let ctor = find(unit, "Plain::Plain", NameRole::Declaration);
        assert_eq!(ctor.len(), 1);
        assert!(ctor[0].target.implicit);
        assert_eq!(ctor[0].length, 0);
        assert_eq!(source.as_bytes()[ctor[0].offset as usize], b'}');
        assert!(find(unit, "Plain::~Plain", NameRole::Declaration)[0].target.implicit);

        let owned = find(unit, "Owned::Owned", NameRole::Declaration);
        assert_eq!(owned.len(), 1);
        assert!(!owned[0].target.implicit);
        assert!(find(unit, "Owned::~Owned", NameRole::Declaration)
            .iter()
            .all(|n| !n.target.implicit));
        assert!(find(unit, "U::U", NameRole::Declaration).is_empty());

        let c = parse("s.c", "struct Plain { int x; };\n");
        assert!(c[0].names.iter().all(|n| !n.target.implicit));
    }

    #[test]
    fn test_pointer_and_reference_arguments() {
        let source = r#"
int a;
int b;
int c;
void by_pointer(int* p);
void by_const_ref(const int& r);
void by_ref(int& r);
void caller() {
    by_pointer(&a);
    by_const_ref(b);
    by_ref(c);
}
"#;
        let files = parse("args.cpp", source);
        let unit = &files[0];
        let access = |name: &str| flags(unit, find(unit, name, NameRole::Reference)[0]);
        assert_eq!(access("a"), (true, true));
        assert_eq!(access("b"), (true, false));
        assert_eq!(access("c"), (true, true));
    }

    #[test]
    fn test_template_instance_references_primary() {
        let source = "template <class T> struct Box { T value; };\nBox<int> boxed;\n";
        let files = parse("t.cpp", source);
        let unit = &files[0];
        let instance = unit
            .names
            .iter()
            .find(|n| n.target.instance_of.is_some())
            .unwrap();
        assert_eq!(instance.target.qualified_name, vec!["Box<int>".to_string()]);
        assert_eq!(instance.target.instance_of, Some(vec!["Box".to_string()]));
    }

    #[test]
    fn test_helpers() {
        assert_eq!(split_scope("::a::b<c::d>::e"), vec!["a", "b", "e"]);
        assert_eq!(split_scope("A::operator<"), vec!["A", "operator<"]);
        assert_eq!(parse_int_literal("0x1F"), Some(31));
        assert_eq!(parse_int_literal("010"), Some(8));
        assert_eq!(parse_int_literal("42UL"), Some(42));
        assert_eq!(parse_int_literal("1.5"), None);
        assert_eq!(binary_op("<<", 1, 4), Some(16));
        assert_eq!(binary_op("/", 1, 0), None);
    }
}
