use graphql_parser::schema::{
    Definition, Directive, EnumValue, Field, InputValue, TypeDefinition, TypeExtension, parse_schema,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

use crate::SubgraphConfig;
use crate::error::{Error, Result};
use crate::schema::{
    EnumValueDef, FieldDef, InputValueDef, OperationKind, SchemaModel, TypeDef, TypeKind, TypeRef,
    print_value,
};

/// Types and fields that exist only for the federation protocol
const FEDERATION_TYPES: [&str; 6] = ["_Service", "_Entity", "_Any", "_FieldSet", "FieldSet", "link__Import"];
const FEDERATION_FIELDS: [&str; 2] = ["_service", "_entities"];

/// A root field owned by a data source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootField {
    pub type_name: String,
    pub field_name: String,
}

/// Where and how a subgraph is reached, plus what it serves
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceConfiguration {
    pub name: String,
    pub url: String,
    pub root_fields: Vec<RootField>,
}

/// The immutable result of composing every known subgraph.
///
/// A new composition always replaces the previous one wholesale.
#[derive(Debug, Clone)]
pub struct ComposedConfiguration {
    pub subgraphs: Vec<SubgraphConfig>,
    pub schema: SchemaModel,
    pub client_sdl: String,
    pub data_sources: Vec<DataSourceConfiguration>,
    /// `"Type.field"` -> owning subgraphs, in composition order
    pub field_owners: HashMap<String, Vec<String>>,
    pub hash: String,
}

impl ComposedConfiguration {
    /// The data source serving a root field
    pub fn owner_of(&self, kind: OperationKind, field_name: &str) -> Option<&DataSourceConfiguration> {
        let root = self.schema.root_type(kind)?;
        let owner = self
            .field_owners
            .get(&format!("{}.{}", root, field_name))?
            .first()?;
        self.data_sources.iter().find(|ds| &ds.name == owner)
    }

    pub fn data_source(&self, name: &str) -> Option<&DataSourceConfiguration> {
        self.data_sources.iter().find(|ds| ds.name == name)
    }
}

/// SHA-256 over every subgraph's name, URL and SDL in subgraph-name order.
///
/// Each field is length-prefixed so neighbouring values cannot run into each other.
pub fn aggregate_hash(subgraphs: &[SubgraphConfig]) -> String {
    let mut ordered: Vec<&SubgraphConfig> = subgraphs.iter().collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for subgraph in ordered {
        for field in [&subgraph.name, &subgraph.url, &subgraph.schema] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Compose subgraph SDLs into one router configuration.
pub fn compose(subgraphs: &[SubgraphConfig]) -> Result<ComposedConfiguration> {
    if subgraphs.is_empty() {
        return Err(Error::Composition("no subgraphs to compose".into()));
    }

    let mut ordered: Vec<SubgraphConfig> = subgraphs.to_vec();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));

    let mut composer = Composer::default();
    for subgraph in &ordered {
        composer.add_subgraph(subgraph)?;
    }
    let (schema, field_owners) = composer.finish()?;

    let data_sources = ordered
        .iter()
        .map(|subgraph| DataSourceConfiguration {
            name: subgraph.name.clone(),
            url: subgraph.url.clone(),
            root_fields: root_fields_owned_by(&schema, &field_owners, &subgraph.name),
        })
        .collect();

    let hash = aggregate_hash(&ordered);
    debug!(hash = %hash, subgraphs = ordered.len(), "composed subgraphs");

    Ok(ComposedConfiguration {
        client_sdl: schema.print(),
        subgraphs: ordered,
        schema,
        data_sources,
        field_owners,
        hash,
    })
}

fn root_fields_owned_by(
    schema: &SchemaModel,
    owners: &HashMap<String, Vec<String>>,
    subgraph: &str,
) -> Vec<RootField> {
    let mut root_fields = Vec::new();
    for kind in [OperationKind::Query, OperationKind::Mutation, OperationKind::Subscription] {
        let Some(root) = schema.root_type(kind) else {
            continue;
        };
        let Some(ty) = schema.get(root) else { continue };
        for field in &ty.fields {
            let key = format!("{}.{}", root, field.name);
            if owners.get(&key).and_then(|o| o.first()).map(String::as_str) == Some(subgraph) {
                root_fields.push(RootField {
                    type_name: root.to_string(),
                    field_name: field.name.clone(),
                });
            }
        }
    }
    root_fields
}

#[derive(Default)]
struct Composer {
    schema: SchemaModel,
    field_owners: HashMap<String, Vec<String>>,
    shareable: HashMap<String, bool>,
}

impl Composer {
    fn add_subgraph(&mut self, subgraph: &SubgraphConfig) -> Result<()> {
        let sdl = strip_schema_extensions(&subgraph.schema);
        let document = parse_schema::<String>(&sdl).map_err(|e| {
            Error::Composition(format!(
                "failed to parse schema for subgraph {}: {}",
                subgraph.name, e
            ))
        })?;

        // Subgraphs may rename their root types; fold them onto the canonical names.
        let mut roots: HashMap<String, &'static str> = HashMap::from([
            ("Query".to_string(), "Query"),
            ("Mutation".to_string(), "Mutation"),
            ("Subscription".to_string(), "Subscription"),
        ]);
        for definition in &document.definitions {
            if let Definition::SchemaDefinition(schema) = definition {
                if let Some(query) = &schema.query {
                    roots.insert(query.clone(), "Query");
                }
                if let Some(mutation) = &schema.mutation {
                    roots.insert(mutation.clone(), "Mutation");
                }
                if let Some(subscription) = &schema.subscription {
                    roots.insert(subscription.clone(), "Subscription");
                }
            }
        }
        let canonical = |name: &str| -> String {
            roots
                .get(name)
                .map(|root| root.to_string())
                .unwrap_or_else(|| name.to_string())
        };

        for definition in &document.definitions {
            match definition {
                Definition::TypeDefinition(typedef) => {
                    self.merge_type(&subgraph.name, typedef_parts(typedef, &canonical))?
                }
                Definition::TypeExtension(extension) => {
                    self.merge_type(&subgraph.name, extension_parts(extension, &canonical))?
                }
                Definition::SchemaDefinition(_) | Definition::DirectiveDefinition(_) => {}
            }
        }
        Ok(())
    }

    fn merge_type(&mut self, subgraph: &str, parts: TypeParts) -> Result<()> {
        if is_federation_type(&parts.name) || has_directive(&parts.directives, "inaccessible") {
            return Ok(());
        }
        let type_shareable = has_directive(&parts.directives, "shareable");

        let existing = self
            .schema
            .types
            .entry(parts.name.clone())
            .or_insert_with(|| TypeDef::new(parts.name.clone(), parts.kind));
        if existing.kind != parts.kind {
            return Err(Error::Composition(format!(
                "type {} is defined as {} and {}",
                parts.name,
                existing.kind.as_str(),
                parts.kind.as_str()
            )));
        }
        if existing.description.is_none() {
            existing.description = parts.description;
        }
        for interface in parts.interfaces {
            if !existing.interfaces.contains(&interface) {
                existing.interfaces.push(interface);
            }
        }
        for member in parts.members {
            if !existing.members.contains(&member) {
                existing.members.push(member);
            }
        }
        for value in parts.enum_values {
            if !existing.enum_values.iter().any(|v| v.name == value.name) {
                existing.enum_values.push(value);
            }
        }
        for field in parts.input_fields {
            match existing.input_field(&field.name) {
                Some(known) if known.ty != field.ty => {
                    return Err(Error::Composition(format!(
                        "input field {}.{} has conflicting types {} and {}",
                        parts.name, field.name, known.ty, field.ty
                    )));
                }
                Some(_) => {}
                None => existing.input_fields.push(field),
            }
        }

        let is_root = matches!(parts.name.as_str(), "Query" | "Mutation" | "Subscription");
        for (field, shareable) in parts.fields {
            let key = format!("{}.{}", parts.name, field.name);
            match existing.field(&field.name) {
                Some(known) if known.ty != field.ty => {
                    return Err(Error::Composition(format!(
                        "field {} has conflicting types {} and {}",
                        key, known.ty, field.ty
                    )));
                }
                Some(_) => {
                    let previously_shareable = self.shareable.get(&key).copied().unwrap_or(false);
                    if is_root && !(previously_shareable || shareable || type_shareable) {
                        let first = self
                            .field_owners
                            .get(&key)
                            .and_then(|owners| owners.first())
                            .cloned()
                            .unwrap_or_default();
                        return Err(Error::Composition(format!(
                            "root field {} is defined in subgraphs {} and {} but is not @shareable",
                            key, first, subgraph
                        )));
                    }
                }
                None => existing.fields.push(field),
            }
            self.shareable
                .entry(key.clone())
                .and_modify(|s| *s |= shareable || type_shareable)
                .or_insert(shareable || type_shareable);
            let owners = self.field_owners.entry(key).or_default();
            if !owners.iter().any(|o| o == subgraph) {
                owners.push(subgraph.to_string());
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(SchemaModel, HashMap<String, Vec<String>>)> {
        // Drop root types that ended up without any fields, e.g. an extension whose only
        // fields were federation internals.
        for root in ["Mutation", "Subscription"] {
            if self.schema.get(root).is_some_and(|ty| ty.fields.is_empty()) {
                self.schema.types.remove(root);
            }
        }
        if self.schema.get("Query").is_none_or(|ty| ty.fields.is_empty()) {
            return Err(Error::Composition("composed schema has no query fields".into()));
        }
        self.schema.mutation_type = self.schema.get("Mutation").map(|_| "Mutation".to_string());
        self.schema.subscription_type = self
            .schema
            .get("Subscription")
            .map(|_| "Subscription".to_string());

        for ty in self.schema.types.values() {
            let references = ty
                .fields
                .iter()
                .flat_map(|field| {
                    std::iter::once(&field.ty).chain(field.args.iter().map(|arg| &arg.ty))
                })
                .chain(ty.input_fields.iter().map(|field| &field.ty));
            for reference in references {
                if !self.schema.types.contains_key(reference.named()) {
                    return Err(Error::Composition(format!(
                        "type {} references unknown type {}",
                        ty.name,
                        reference.named()
                    )));
                }
            }
            for member in ty.members.iter().chain(ty.interfaces.iter()) {
                if !self.schema.types.contains_key(member) {
                    return Err(Error::Composition(format!(
                        "type {} references unknown type {}",
                        ty.name, member
                    )));
                }
            }
        }

        Ok((self.schema, self.field_owners))
    }
}

struct TypeParts {
    name: String,
    kind: TypeKind,
    description: Option<String>,
    directives: Vec<String>,
    fields: Vec<(FieldDef, bool)>,
    input_fields: Vec<InputValueDef>,
    enum_values: Vec<EnumValueDef>,
    members: Vec<String>,
    interfaces: Vec<String>,
}

impl TypeParts {
    fn new(name: String, kind: TypeKind, directives: &[Directive<'_, String>]) -> Self {
        Self {
            name,
            kind,
            description: None,
            directives: directive_names(directives),
            fields: Vec::new(),
            input_fields: Vec::new(),
            enum_values: Vec::new(),
            members: Vec::new(),
            interfaces: Vec::new(),
        }
    }
}

fn typedef_parts<'a>(typedef: &TypeDefinition<'a, String>, canonical: &dyn Fn(&str) -> String) -> TypeParts {
    match typedef {
        TypeDefinition::Scalar(scalar) => {
            let mut parts = TypeParts::new(scalar.name.clone(), TypeKind::Scalar, &scalar.directives);
            parts.description = scalar.description.clone();
            parts
        }
        TypeDefinition::Object(object) => {
            let mut parts = TypeParts::new(canonical(&object.name), TypeKind::Object, &object.directives);
            parts.description = object.description.clone();
            parts.interfaces = object.implements_interfaces.clone();
            parts.fields = lower_fields(&object.fields);
            parts
        }
        TypeDefinition::Interface(interface) => {
            let mut parts = TypeParts::new(interface.name.clone(), TypeKind::Interface, &interface.directives);
            parts.description = interface.description.clone();
            parts.interfaces = interface.implements_interfaces.clone();
            parts.fields = lower_fields(&interface.fields);
            parts
        }
        TypeDefinition::Union(union) => {
            let mut parts = TypeParts::new(union.name.clone(), TypeKind::Union, &union.directives);
            parts.description = union.description.clone();
            parts.members = visible_members(&union.types);
            parts
        }
        TypeDefinition::Enum(enumeration) => {
            let mut parts = TypeParts::new(enumeration.name.clone(), TypeKind::Enum, &enumeration.directives);
            parts.description = enumeration.description.clone();
            parts.enum_values = lower_enum_values(&enumeration.values);
            parts
        }
        TypeDefinition::InputObject(input) => {
            let mut parts = TypeParts::new(input.name.clone(), TypeKind::InputObject, &input.directives);
            parts.description = input.description.clone();
            parts.input_fields = lower_input_values(&input.fields);
            parts
        }
    }
}

fn extension_parts<'a>(extension: &TypeExtension<'a, String>, canonical: &dyn Fn(&str) -> String) -> TypeParts {
    match extension {
        TypeExtension::Scalar(scalar) => TypeParts::new(scalar.name.clone(), TypeKind::Scalar, &scalar.directives),
        TypeExtension::Object(object) => {
            let mut parts = TypeParts::new(canonical(&object.name), TypeKind::Object, &object.directives);
            parts.interfaces = object.implements_interfaces.clone();
            parts.fields = lower_fields(&object.fields);
            parts
        }
        TypeExtension::Interface(interface) => {
            let mut parts = TypeParts::new(interface.name.clone(), TypeKind::Interface, &interface.directives);
            parts.fields = lower_fields(&interface.fields);
            parts
        }
        TypeExtension::Union(union) => {
            let mut parts = TypeParts::new(union.name.clone(), TypeKind::Union, &union.directives);
            parts.members = visible_members(&union.types);
            parts
        }
        TypeExtension::Enum(enumeration) => {
            let mut parts = TypeParts::new(enumeration.name.clone(), TypeKind::Enum, &enumeration.directives);
            parts.enum_values = lower_enum_values(&enumeration.values);
            parts
        }
        TypeExtension::InputObject(input) => {
            let mut parts = TypeParts::new(input.name.clone(), TypeKind::InputObject, &input.directives);
            parts.input_fields = lower_input_values(&input.fields);
            parts
        }
    }
}

fn visible_members(types: &[String]) -> Vec<String> {
    types.iter().filter(|t| !is_federation_type(t)).cloned().collect()
}

/// Fields with their `@shareable` flag. `@external` fields are references to another
/// subgraph's definition and `@inaccessible` fields are hidden from clients.
fn lower_fields<'a>(fields: &[Field<'a, String>]) -> Vec<(FieldDef, bool)> {
    fields
        .iter()
        .filter(|field| !FEDERATION_FIELDS.contains(&field.name.as_str()))
        .filter(|field| {
            !has_ast_directive(&field.directives, "external")
                && !has_ast_directive(&field.directives, "inaccessible")
        })
        .map(|field| {
            (
                FieldDef {
                    name: field.name.clone(),
                    description: field.description.clone(),
                    args: lower_input_values(&field.arguments),
                    ty: TypeRef::from_ast(&field.field_type),
                    deprecation_reason: deprecation_reason(&field.directives),
                },
                has_ast_directive(&field.directives, "shareable"),
            )
        })
        .collect()
}

fn lower_input_values<'a>(values: &[InputValue<'a, String>]) -> Vec<InputValueDef> {
    values
        .iter()
        .filter(|value| !has_ast_directive(&value.directives, "inaccessible"))
        .map(|value| InputValueDef {
            name: value.name.clone(),
            description: value.description.clone(),
            ty: TypeRef::from_ast(&value.value_type),
            default_value: value.default_value.as_ref().map(print_value),
        })
        .collect()
}

fn lower_enum_values<'a>(values: &[EnumValue<'a, String>]) -> Vec<EnumValueDef> {
    values
        .iter()
        .filter(|value| !has_ast_directive(&value.directives, "inaccessible"))
        .map(|value| EnumValueDef {
            name: value.name.clone(),
            description: value.description.clone(),
            deprecation_reason: deprecation_reason(&value.directives),
        })
        .collect()
}

fn deprecation_reason<'a>(directives: &[Directive<'a, String>]) -> Option<String> {
    let directive = directives.iter().find(|d| d.name == "deprecated")?;
    let reason = directive
        .arguments
        .iter()
        .find(|(name, _)| name == "reason")
        .and_then(|(_, value)| match value {
            graphql_parser::query::Value::String(reason) => Some(reason.clone()),
            _ => None,
        });
    Some(reason.unwrap_or_else(|| "No longer supported".to_string()))
}

fn directive_names<'a>(directives: &[Directive<'a, String>]) -> Vec<String> {
    directives.iter().map(|d| d.name.clone()).collect()
}

fn has_ast_directive<'a>(directives: &[Directive<'a, String>], name: &str) -> bool {
    directives.iter().any(|d| d.name == name)
}

fn has_directive(directives: &[String], name: &str) -> bool {
    directives.iter().any(|d| d == name)
}

fn is_federation_type(name: &str) -> bool {
    FEDERATION_TYPES.contains(&name)
        || name.starts_with("link__")
        || name.starts_with("federation__")
        || name.starts_with("join__")
}

/// Remove `extend schema ...` statements, which the SDL parser does not accept.
///
/// Federation 2 subgraphs open with `extend schema @link(url: ..., import: [...])`; the
/// statement only carries directives, so it ends where the next definition keyword begins
/// at parenthesis/bracket depth zero.
pub fn strip_schema_extensions(sdl: &str) -> String {
    const KEYWORDS: [&str; 9] = [
        "type", "interface", "union", "enum", "input", "scalar", "directive", "extend", "schema",
    ];

    let mut out = String::with_capacity(sdl.len());
    let mut rest = sdl;
    while let Some((start, keyword_end)) = find_extend_schema(rest) {
        out.push_str(&rest[..start]);
        let after = &rest[keyword_end..];

        let mut depth = 0i32;
        let mut in_string = false;
        let mut end = after.len();
        let bytes = after.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            if in_string {
                if c == b'\\' {
                    i += 1;
                } else if c == b'"' {
                    in_string = false;
                }
            } else {
                match c {
                    b'"' => in_string = true,
                    b'(' | b'[' | b'{' => depth += 1,
                    b')' | b']' | b'}' => depth -= 1,
                    b'#' => {
                        while i < bytes.len() && bytes[i] != b'\n' {
                            i += 1;
                        }
                    }
                    _ if depth == 0 && (i == 0 || bytes[i - 1].is_ascii_whitespace()) => {
                        let tail = &after[i..];
                        if KEYWORDS.iter().any(|kw| starts_with_word(tail, kw)) {
                            end = i;
                            break;
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        rest = &after[end..];
    }
    out.push_str(rest);
    out
}

/// Byte range of the next `extend schema` keyword pair
fn find_extend_schema(sdl: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    while let Some(found) = sdl[offset..].find("extend") {
        let start = offset + found;
        let after_extend = start + "extend".len();
        let tail = &sdl[after_extend..];
        let trimmed = tail.trim_start();
        let at_word_start = start == 0 || !sdl.as_bytes()[start - 1].is_ascii_alphanumeric();
        if at_word_start && trimmed.len() < tail.len() && starts_with_word(trimmed, "schema") {
            let end = after_extend + (tail.len() - trimmed.len()) + "schema".len();
            return Some((start, end));
        }
        offset = after_extend;
    }
    None
}

fn starts_with_word(text: &str, word: &str) -> bool {
    text.starts_with(word)
        && text[word.len()..]
            .chars()
            .next()
            .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn subgraph(name: &str, schema: &str) -> SubgraphConfig {
        SubgraphConfig {
            name: name.to_string(),
            url: format!("http://{}/graphql", name),
            schema: schema.to_string(),
        }
    }

    const ACCOUNTS: &str = r#"
extend schema
  @link(url: "https://specs.apollo.dev/federation/v2.3", import: ["@key", "@shareable"])

type Query {
  me: User
  users(first: Int = 10): [User!]!
  _service: _Service!
}

type User @key(fields: "id") {
  id: ID!
  name: String
  email: String @inaccessible
}

type _Service { sdl: String }
"#;

    const PRODUCTS: &str = r#"
type Query {
  topProducts(first: Int = 5): [Product]
}

type Mutation {
  createProduct(name: String!): Product
}

type Subscription {
  productAdded: Product
}

type Product @key(fields: "upc") {
  upc: String!
  name: String
  price: Int @deprecated(reason: "use cost")
}

extend type User @key(fields: "id") {
  id: ID! @external
  purchases: [Product]
}
"#;

    #[test]
    fn test_strip_schema_extensions() {
        let stripped = strip_schema_extensions(ACCOUNTS);
        assert!(!stripped.contains("extend schema"));
        assert!(!stripped.contains("@link"));
        assert!(stripped.contains("type Query"));
    }

    #[test]
    fn test_compose_merges_subgraphs() {
        let composed = compose(&[subgraph("products", PRODUCTS), subgraph("accounts", ACCOUNTS)])
            .unwrap();

        let user = composed.schema.get("User").unwrap();
        let names: Vec<&str> = user.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "purchases"]);

        assert!(composed.schema.get("_Service").is_none());
        assert!(composed.schema.field("Query", "_service").is_none());
        assert_eq!(composed.schema.mutation_type.as_deref(), Some("Mutation"));
        assert_eq!(composed.schema.subscription_type.as_deref(), Some("Subscription"));

        let owner = composed.owner_of(OperationKind::Query, "topProducts").unwrap();
        assert_eq!(owner.name, "products");
        let owner = composed.owner_of(OperationKind::Query, "me").unwrap();
        assert_eq!(owner.name, "accounts");

        let price = composed.schema.field("Product", "price").unwrap();
        assert_eq!(price.deprecation_reason.as_deref(), Some("use cost"));
        assert!(!composed.client_sdl.contains("email"));
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a = subgraph("accounts", ACCOUNTS);
        let b = subgraph("products", PRODUCTS);
        assert_eq!(
            aggregate_hash(&[a.clone(), b.clone()]),
            aggregate_hash(&[b.clone(), a.clone()])
        );

        let mut changed = b.clone();
        changed.schema.push_str("\nscalar Extra\n");
        assert_ne!(aggregate_hash(&[a.clone(), b]), aggregate_hash(&[a, changed]));
    }

    #[test]
    fn test_hash_separates_subgraph_boundaries() {
        let split = [subgraph("a", "type Query { x: Int }"), subgraph("b", "scalar Y")];
        let merged = [subgraph("a", "type Query { x: Int }scalar Y"), subgraph("b", "")];
        assert_ne!(aggregate_hash(&split), aggregate_hash(&merged));

        let mut moved = subgraph("a", "type Query { x: Int }");
        moved.url = "http://elsewhere:4001/graphql".into();
        assert_ne!(
            aggregate_hash(&[subgraph("a", "type Query { x: Int }")]),
            aggregate_hash(&[moved])
        );
    }

    #[test]
    fn test_conflicting_field_types_fail() {
        let result = compose(&[
            subgraph("a", "type Query { a: Int } type Thing { id: ID }"),
            subgraph("b", "type Query { b: Int } type Thing { id: String }"),
        ]);
        assert!(matches!(result, Err(Error::Composition(_))));
    }

    #[test]
    fn test_duplicate_root_field_requires_shareable() {
        let result = compose(&[
            subgraph("a", "type Query { shared: Int }"),
            subgraph("b", "type Query { shared: Int }"),
        ]);
        assert!(matches!(result, Err(Error::Composition(_))));

        let composed = compose(&[
            subgraph("a", "type Query { shared: Int @shareable }"),
            subgraph("b", "type Query { shared: Int @shareable }"),
        ])
        .unwrap();
        assert_eq!(
            composed.field_owners.get("Query.shared").unwrap(),
            &vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(composed.owner_of(OperationKind::Query, "shared").unwrap().name, "a");
    }

    #[test]
    fn test_unparseable_sdl_fails() {
        let result = compose(&[subgraph("broken", "type Query {")]);
        match result {
            Err(Error::Composition(message)) => assert!(message.contains("broken")),
            other => panic!("expected composition error, got {:?}", other.map(|c| c.hash)),
        }
    }

    #[test]
    fn test_custom_root_type_names() {
        let composed = compose(&[subgraph(
            "legacy",
            "schema { query: RootQuery } type RootQuery { ping: String }",
        )])
        .unwrap();
        assert!(composed.schema.field("Query", "ping").is_some());
        assert_eq!(composed.data_sources[0].root_fields.len(), 1);
    }
}
