//! Owned schema model used for validation, planning and introspection.
//!
//! `graphql-parser` documents borrow from their source text; the composed schema outlives
//! every subgraph SDL, so composition lowers the parsed AST into these owned types.

use graphql_parser::query::{Type, Value};
use serde_json::Value as Json;
use std::{collections::BTreeMap, fmt};

pub const BUILTIN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

impl TypeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Scalar => "SCALAR",
            TypeKind::Object => "OBJECT",
            TypeKind::Interface => "INTERFACE",
            TypeKind::Union => "UNION",
            TypeKind::Enum => "ENUM",
            TypeKind::InputObject => "INPUT_OBJECT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn from_ast<'a>(ty: &Type<'a, String>) -> Self {
        match ty {
            Type::NamedType(name) => TypeRef::Named(name.clone()),
            Type::ListType(inner) => TypeRef::List(Box::new(TypeRef::from_ast(inner))),
            Type::NonNullType(inner) => TypeRef::NonNull(Box::new(TypeRef::from_ast(inner))),
        }
    }

    pub fn to_ast<'a>(&self) -> Type<'a, String> {
        match self {
            TypeRef::Named(name) => Type::NamedType(name.clone()),
            TypeRef::List(inner) => Type::ListType(Box::new(inner.to_ast())),
            TypeRef::NonNull(inner) => Type::NonNullType(Box::new(inner.to_ast())),
        }
    }

    /// The innermost named type
    pub fn named(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.named(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => write!(f, "{}", name),
            TypeRef::List(inner) => write!(f, "[{}]", inner),
            TypeRef::NonNull(inner) => write!(f, "{}!", inner),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputValueDef {
    pub name: String,
    pub description: Option<String>,
    pub ty: TypeRef,
    /// Printed GraphQL literal
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub description: Option<String>,
    pub args: Vec<InputValueDef>,
    pub ty: TypeRef,
    pub deprecation_reason: Option<String>,
}

impl FieldDef {
    pub fn arg(&self, name: &str) -> Option<&InputValueDef> {
        self.args.iter().find(|arg| arg.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValueDef {
    pub name: String,
    pub description: Option<String>,
    pub deprecation_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
    pub description: Option<String>,
    pub fields: Vec<FieldDef>,
    pub input_fields: Vec<InputValueDef>,
    pub enum_values: Vec<EnumValueDef>,
    /// Union members
    pub members: Vec<String>,
    pub interfaces: Vec<String>,
}

impl TypeDef {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            fields: Vec::new(),
            input_fields: Vec::new(),
            enum_values: Vec::new(),
            members: Vec::new(),
            interfaces: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn input_field(&self, name: &str) -> Option<&InputValueDef> {
        self.input_fields.iter().find(|field| field.name == name)
    }

    pub fn is_composite(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Object | TypeKind::Interface | TypeKind::Union
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

/// The merged schema
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaModel {
    pub query_type: String,
    pub mutation_type: Option<String>,
    pub subscription_type: Option<String>,
    pub types: BTreeMap<String, TypeDef>,
}

impl Default for SchemaModel {
    fn default() -> Self {
        let mut types = BTreeMap::new();
        for scalar in BUILTIN_SCALARS {
            types.insert(scalar.to_string(), TypeDef::new(scalar, TypeKind::Scalar));
        }
        Self {
            query_type: "Query".to_string(),
            mutation_type: None,
            subscription_type: None,
            types,
        }
    }
}

impl SchemaModel {
    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDef> {
        self.types.get(type_name)?.field(field_name)
    }

    pub fn root_type(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => Some(self.query_type.as_str()),
            OperationKind::Mutation => self.mutation_type.as_deref(),
            OperationKind::Subscription => self.subscription_type.as_deref(),
        }
        .filter(|name| self.types.contains_key(*name))
    }

    pub fn is_leaf(&self, name: &str) -> bool {
        self.types
            .get(name)
            .map(|ty| matches!(ty.kind, TypeKind::Scalar | TypeKind::Enum))
            .unwrap_or(false)
    }

    pub fn is_input_type(&self, name: &str) -> bool {
        self.types
            .get(name)
            .map(|ty| {
                matches!(
                    ty.kind,
                    TypeKind::Scalar | TypeKind::Enum | TypeKind::InputObject
                )
            })
            .unwrap_or(false)
    }

    /// Object types a value of `name` may resolve to
    pub fn possible_types(&self, name: &str) -> Vec<&str> {
        match self.types.get(name) {
            Some(ty) if ty.kind == TypeKind::Object => vec![ty.name.as_str()],
            Some(ty) if ty.kind == TypeKind::Union => {
                ty.members.iter().map(String::as_str).collect()
            }
            Some(ty) if ty.kind == TypeKind::Interface => self
                .types
                .values()
                .filter(|candidate| candidate.interfaces.iter().any(|i| i == name))
                .map(|candidate| candidate.name.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether an inline fragment on `condition` may apply inside a selection on `parent`
    pub fn fragment_applies(&self, parent: &str, condition: &str) -> bool {
        if parent == condition {
            return true;
        }
        let parent_types = self.possible_types(parent);
        self.possible_types(condition)
            .iter()
            .any(|ty| parent_types.contains(ty))
    }

    /// Print the schema as SDL
    pub fn print(&self) -> String {
        let mut out = String::new();
        let custom_roots = self.query_type != "Query"
            || self.mutation_type.as_deref().is_some_and(|m| m != "Mutation")
            || self
                .subscription_type
                .as_deref()
                .is_some_and(|s| s != "Subscription");
        if custom_roots {
            out.push_str("schema {\n");
            out.push_str(&format!("  query: {}\n", self.query_type));
            if let Some(mutation) = &self.mutation_type {
                out.push_str(&format!("  mutation: {}\n", mutation));
            }
            if let Some(subscription) = &self.subscription_type {
                out.push_str(&format!("  subscription: {}\n", subscription));
            }
            out.push_str("}\n\n");
        }

        for ty in self.types.values() {
            if ty.kind == TypeKind::Scalar && BUILTIN_SCALARS.contains(&ty.name.as_str()) {
                continue;
            }
            print_description(&mut out, ty.description.as_deref(), "");
            match ty.kind {
                TypeKind::Scalar => out.push_str(&format!("scalar {}\n\n", ty.name)),
                TypeKind::Object | TypeKind::Interface => {
                    let keyword = if ty.kind == TypeKind::Object {
                        "type"
                    } else {
                        "interface"
                    };
                    out.push_str(&format!("{} {}", keyword, ty.name));
                    if !ty.interfaces.is_empty() {
                        out.push_str(&format!(" implements {}", ty.interfaces.join(" & ")));
                    }
                    out.push_str(" {\n");
                    for field in &ty.fields {
                        print_description(&mut out, field.description.as_deref(), "  ");
                        out.push_str(&format!("  {}", field.name));
                        if !field.args.is_empty() {
                            let args: Vec<String> = field.args.iter().map(print_input_value).collect();
                            out.push_str(&format!("({})", args.join(", ")));
                        }
                        out.push_str(&format!(": {}", field.ty));
                        print_deprecation(&mut out, field.deprecation_reason.as_deref());
                        out.push('\n');
                    }
                    out.push_str("}\n\n");
                }
                TypeKind::Union => {
                    out.push_str(&format!("union {} = {}\n\n", ty.name, ty.members.join(" | ")));
                }
                TypeKind::Enum => {
                    out.push_str(&format!("enum {} {{\n", ty.name));
                    for value in &ty.enum_values {
                        print_description(&mut out, value.description.as_deref(), "  ");
                        out.push_str(&format!("  {}", value.name));
                        print_deprecation(&mut out, value.deprecation_reason.as_deref());
                        out.push('\n');
                    }
                    out.push_str("}\n\n");
                }
                TypeKind::InputObject => {
                    out.push_str(&format!("input {} {{\n", ty.name));
                    for field in &ty.input_fields {
                        print_description(&mut out, field.description.as_deref(), "  ");
                        out.push_str(&format!("  {}\n", print_input_value(field)));
                    }
                    out.push_str("}\n\n");
                }
            }
        }
        out.trim_end().to_string()
    }
}

fn print_description(out: &mut String, description: Option<&str>, indent: &str) {
    if let Some(description) = description {
        out.push_str(&format!(
            "{}\"{}\"\n",
            indent,
            description.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
        ));
    }
}

fn print_deprecation(out: &mut String, reason: Option<&str>) {
    if let Some(reason) = reason {
        out.push_str(&format!(" @deprecated(reason: {})", Json::String(reason.to_string())));
    }
}

fn print_input_value(value: &InputValueDef) -> String {
    match &value.default_value {
        Some(default) => format!("{}: {} = {}", value.name, value.ty, default),
        None => format!("{}: {}", value.name, value.ty),
    }
}

/// Print a GraphQL literal
pub fn print_value<'a>(value: &Value<'a, String>) -> String {
    match value {
        Value::Variable(name) => format!("${}", name),
        Value::Int(number) => number.as_i64().map(|n| n.to_string()).unwrap_or_default(),
        Value::Float(float) => float.to_string(),
        Value::String(string) => Json::String(string.clone()).to_string(),
        Value::Boolean(boolean) => boolean.to_string(),
        Value::Null => "null".to_string(),
        Value::Enum(name) => name.clone(),
        Value::List(items) => {
            let items: Vec<String> = items.iter().map(print_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(fields) => {
            let fields: Vec<String> = fields
                .iter()
                .map(|(key, value)| format!("{}: {}", key, print_value(value)))
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
    }
}

/// Convert a constant GraphQL literal to JSON. Variables resolve through `variables`.
pub fn value_to_json<'a>(value: &Value<'a, String>, variables: &serde_json::Map<String, Json>) -> Json {
    match value {
        Value::Variable(name) => variables.get(name).cloned().unwrap_or(Json::Null),
        Value::Int(number) => number.as_i64().map(Json::from).unwrap_or(Json::Null),
        Value::Float(float) => serde_json::Number::from_f64(*float)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::String(string) => Json::String(string.clone()),
        Value::Boolean(boolean) => Json::Bool(*boolean),
        Value::Null => Json::Null,
        Value::Enum(name) => Json::String(name.clone()),
        Value::List(items) => Json::Array(items.iter().map(|v| value_to_json(v, variables)).collect()),
        Value::Object(fields) => Json::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), value_to_json(value, variables)))
                .collect(),
        ),
    }
}

/// Whether a literal references any variable
pub fn contains_variable<'a>(value: &Value<'a, String>) -> bool {
    match value {
        Value::Variable(_) => true,
        Value::List(items) => items.iter().any(contains_variable),
        Value::Object(fields) => fields.values().any(contains_variable),
        _ => false,
    }
}
