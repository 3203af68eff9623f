//! The mlld AST: a closed tagged union of document nodes.
//!
//! Producing these nodes from source text is the parser's job and is out of
//! scope for this crate (see the `Parser` trait in `crate::contracts`). This
//! module defines the node shapes the evaluator consumes, plus small builder
//! functions so tests can construct trees directly without a real parser.

use std::collections::BTreeMap;
use std::fmt;

/// A location in the original source document. `(0, 0)` is used for
/// synthetic nodes built directly by tests or by the engine itself
/// (e.g. builtin transformer registration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

impl SourceLocation {
    pub const SYNTHETIC: SourceLocation = SourceLocation { line: 0, column: 0, offset: 0 };

    pub fn new(line: u32, column: u32, offset: u32) -> Self {
        Self { line, column, offset }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Directive kinds, matching the slash-prefixed forms in the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    Var,
    Exe,
    Run,
    Show,
    Import,
    Export,
    When,
    For,
    Output,
    Guard,
    Sign,
    Verify,
    Policy,
    Log,
}

/// A parsed interpolation-node sequence (template body, command template,
/// code body). Each element is either literal text or an embedded
/// expression-producing node.
pub type NodeList = Vec<Node>;

/// Interpolation flavor for `template` executables and `/show`/`/var`
/// template literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationKind {
    /// `@var` backtick templates.
    Backtick,
    /// `{{var}}` triple-colon/mustache templates.
    Mustache,
    /// `@var` inside an at-sign template (default `::...::` form).
    At,
}

/// Languages a `code` executable body may be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeLanguage {
    Js,
    Node,
    Python,
    Sh,
    Bash,
    MlldForeach,
    MlldWhen,
}

/// A field-access step: dotted name, bracket index/slice, or optional-suffix.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldStep {
    Name(String),
    Index(i64),
    Slice(Option<i64>, Option<i64>),
    StringKey(String),
    /// Marks the preceding step as optional (`foo.bar?`): missing value
    /// yields `null` rather than an error.
    Optional,
}

/// A condensed pipe or with-clause pipeline stage reference attached to a
/// variable reference or exec invocation.
#[derive(Debug, Clone)]
pub struct PipeStage {
    pub target: Box<Node>,
    pub args: Vec<Node>,
    pub location: SourceLocation,
}

/// Label modifier forms (`+label`, `-label`, `clear`, `trusted`, `untrusted`,
/// `trusted!`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelOp {
    Add(String),
    Remove(String),
    Clear,
    Trusted,
    Untrusted,
    TrustedForce,
}

/// Binary/unary/ternary expression operators used inside `/when` conditions
/// and pipeline guard expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    And,
    Or,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
}

/// `withClause` attached to an exec invocation or `/run` directive.
#[derive(Debug, Clone, Default)]
pub struct WithClause {
    pub pipeline: Vec<PipeStage>,
    pub stdin: Option<Box<Node>>,
    pub stream: bool,
    pub stream_format: Option<String>,
    pub trust: Option<TrustLevel>,
    pub needs_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    Always,
    Never,
    Verify,
}

/// A load-content source: a file path, section selector, or glob.
#[derive(Debug, Clone)]
pub struct LoadContentSource {
    pub path_template: NodeList,
    pub section: Option<NodeList>,
    pub rename: Option<NodeList>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadContentOptions {
    pub fuzzy_match: bool,
}

/// The closed tagged union of AST nodes (§3.1).
#[derive(Debug, Clone)]
pub enum Node {
    Text {
        value: String,
        location: SourceLocation,
    },
    CodeFence {
        language: Option<String>,
        body: String,
        location: SourceLocation,
    },
    Directive {
        kind: DirectiveKind,
        subtype: String,
        values: BTreeMap<String, Node>,
        meta: BTreeMap<String, String>,
        location: SourceLocation,
    },
    VariableReference {
        identifier: String,
        fields: Vec<FieldStep>,
        pipes: Vec<PipeStage>,
        tail: Option<Box<Node>>,
        location: SourceLocation,
    },
    VariableReferenceWithTail {
        base: Box<Node>,
        tail: Box<Node>,
        location: SourceLocation,
    },
    ExecInvocation {
        command_ref: Box<Node>,
        args: Vec<Node>,
        with_clause: Option<WithClause>,
        location: SourceLocation,
    },
    Template {
        nodes: NodeList,
        interpolation: InterpolationKind,
        location: SourceLocation,
    },
    LoadContent {
        source: LoadContentSource,
        options: LoadContentOptions,
        location: SourceLocation,
    },
    ObjectLiteral {
        entries: Vec<(String, Node)>,
        location: SourceLocation,
    },
    ArrayLiteral {
        elements: Vec<Node>,
        location: SourceLocation,
    },
    LabelModification {
        target: Box<Node>,
        ops: Vec<LabelOp>,
        location: SourceLocation,
    },
    BinaryExpr {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
        location: SourceLocation,
    },
    UnaryExpr {
        op: UnaryOp,
        operand: Box<Node>,
        location: SourceLocation,
    },
    TernaryExpr {
        condition: Box<Node>,
        when_true: Box<Node>,
        when_false: Box<Node>,
        location: SourceLocation,
    },
    WhenExpression {
        subject: Option<Box<Node>>,
        arms: Vec<(Node, Node)>,
        location: SourceLocation,
    },
    ForExpression {
        binding: String,
        iterable: Box<Node>,
        body: NodeList,
        location: SourceLocation,
    },
    ForeachCommand {
        template: Box<Node>,
        arg_lists: Vec<Vec<Node>>,
        location: SourceLocation,
    },
    GuardBlock {
        name: String,
        op_label: String,
        arms: Vec<(Node, Node)>,
        location: SourceLocation,
    },
    PolicyBlock {
        name: String,
        allow: Vec<String>,
        deny: Vec<String>,
        autoverify: bool,
        location: SourceLocation,
    },
}

impl Node {
    pub fn location(&self) -> SourceLocation {
        match self {
            Node::Text { location, .. }
            | Node::CodeFence { location, .. }
            | Node::Directive { location, .. }
            | Node::VariableReference { location, .. }
            | Node::VariableReferenceWithTail { location, .. }
            | Node::ExecInvocation { location, .. }
            | Node::Template { location, .. }
            | Node::LoadContent { location, .. }
            | Node::ObjectLiteral { location, .. }
            | Node::ArrayLiteral { location, .. }
            | Node::LabelModification { location, .. }
            | Node::BinaryExpr { location, .. }
            | Node::UnaryExpr { location, .. }
            | Node::TernaryExpr { location, .. }
            | Node::WhenExpression { location, .. }
            | Node::ForExpression { location, .. }
            | Node::ForeachCommand { location, .. }
            | Node::GuardBlock { location, .. }
            | Node::PolicyBlock { location, .. } => *location,
        }
    }

    /// Stable label for error messages and dispatch-table keys.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Text { .. } => "Text",
            Node::CodeFence { .. } => "CodeFence",
            Node::Directive { .. } => "Directive",
            Node::VariableReference { .. } => "VariableReference",
            Node::VariableReferenceWithTail { .. } => "VariableReferenceWithTail",
            Node::ExecInvocation { .. } => "ExecInvocation",
            Node::Template { .. } => "Template",
            Node::LoadContent { .. } => "LoadContent",
            Node::ObjectLiteral { .. } => "ObjectLiteral",
            Node::ArrayLiteral { .. } => "ArrayLiteral",
            Node::LabelModification { .. } => "LabelModification",
            Node::BinaryExpr { .. } => "BinaryExpr",
            Node::UnaryExpr { .. } => "UnaryExpr",
            Node::TernaryExpr { .. } => "TernaryExpr",
            Node::WhenExpression { .. } => "WhenExpression",
            Node::ForExpression { .. } => "ForExpression",
            Node::ForeachCommand { .. } => "ForeachCommand",
            Node::GuardBlock { .. } => "GuardBlock",
            Node::PolicyBlock { .. } => "PolicyBlock",
        }
    }

    // --- builders, used by tests (and by the engine's own builtin setup) ---

    pub fn text(value: impl Into<String>) -> Self {
        Node::Text { value: value.into(), location: SourceLocation::SYNTHETIC }
    }

    pub fn var_ref(identifier: impl Into<String>) -> Self {
        Node::VariableReference {
            identifier: identifier.into(),
            fields: Vec::new(),
            pipes: Vec::new(),
            tail: None,
            location: SourceLocation::SYNTHETIC,
        }
    }

    pub fn var_ref_fields(identifier: impl Into<String>, fields: Vec<FieldStep>) -> Self {
        Node::VariableReference {
            identifier: identifier.into(),
            fields,
            pipes: Vec::new(),
            tail: None,
            location: SourceLocation::SYNTHETIC,
        }
    }

    pub fn template(nodes: NodeList, interpolation: InterpolationKind) -> Self {
        Node::Template { nodes, interpolation, location: SourceLocation::SYNTHETIC }
    }

    pub fn exec_invocation(command_ref: Node, args: Vec<Node>) -> Self {
        Node::ExecInvocation {
            command_ref: Box::new(command_ref),
            args,
            with_clause: None,
            location: SourceLocation::SYNTHETIC,
        }
    }

    pub fn directive(
        kind: DirectiveKind,
        subtype: impl Into<String>,
        values: BTreeMap<String, Node>,
    ) -> Self {
        Node::Directive {
            kind,
            subtype: subtype.into(),
            values,
            meta: BTreeMap::new(),
            location: SourceLocation::SYNTHETIC,
        }
    }

    pub fn object(entries: Vec<(&str, Node)>) -> Self {
        Node::ObjectLiteral {
            entries: entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            location: SourceLocation::SYNTHETIC,
        }
    }

    pub fn array(elements: Vec<Node>) -> Self {
        Node::ArrayLiteral { elements, location: SourceLocation::SYNTHETIC }
    }
}
