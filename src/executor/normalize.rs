//! Operation normalization.
//!
//! Produces a single operation with fragments inlined, literal `@skip`/`@include` applied,
//! unused variable definitions dropped and, in a second pass, literal arguments lifted into
//! variables so that operations differing only in argument values share one plan.

use graphql_parser::Pos;
use graphql_parser::query::{
    Definition, Directive, Document, Field, FragmentDefinition, InlineFragment, Mutation,
    OperationDefinition, Query, Selection, SelectionSet, Subscription, TypeCondition, Value,
    VariableDefinition,
};
use serde_json::{Map, Value as Json};
use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::error::{Error, GraphQLError, Result};
use crate::schema::{OperationKind, SchemaModel, contains_variable, value_to_json};

/// One executable operation, free of fragment definitions
#[derive(Debug, Clone)]
pub struct NormalizedOperation<'a> {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub position: Pos,
    pub variable_definitions: Vec<VariableDefinition<'a, String>>,
    pub directives: Vec<Directive<'a, String>>,
    pub selection_set: SelectionSet<'a, String>,
}

impl<'a> NormalizedOperation<'a> {
    pub fn to_document(&self) -> Document<'a, String> {
        build_document(
            self.kind,
            self.name.clone(),
            self.position,
            self.variable_definitions.clone(),
            self.directives.clone(),
            self.selection_set.clone(),
        )
    }

    /// Printed form; whitespace and comments of the original text do not survive
    pub fn print(&self) -> String {
        self.to_document().to_string()
    }

    /// 64-bit key of the printed operation
    pub fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.print().hash(&mut hasher);
        hasher.finish()
    }
}

pub(crate) fn build_document<'a>(
    kind: OperationKind,
    name: Option<String>,
    position: Pos,
    variable_definitions: Vec<VariableDefinition<'a, String>>,
    directives: Vec<Directive<'a, String>>,
    selection_set: SelectionSet<'a, String>,
) -> Document<'a, String> {
    let operation = match kind {
        OperationKind::Query => OperationDefinition::Query(Query {
            position,
            name,
            variable_definitions,
            directives,
            selection_set,
        }),
        OperationKind::Mutation => OperationDefinition::Mutation(Mutation {
            position,
            name,
            variable_definitions,
            directives,
            selection_set,
        }),
        OperationKind::Subscription => OperationDefinition::Subscription(Subscription {
            position,
            name,
            variable_definitions,
            directives,
            selection_set,
        }),
    };
    Document {
        definitions: vec![Definition::Operation(operation)],
    }
}

/// Pick the requested operation and normalize it.
pub fn normalize<'a>(
    document: Document<'a, String>,
    operation_name: Option<&str>,
) -> Result<NormalizedOperation<'a>> {
    let mut operations = Vec::new();
    let mut fragments: HashMap<String, FragmentDefinition<'a, String>> = HashMap::new();
    for definition in document.definitions {
        match definition {
            Definition::Operation(operation) => operations.push(operation),
            Definition::Fragment(fragment) => {
                fragments.insert(fragment.name.clone(), fragment);
            }
        }
    }

    let operation = select_operation(operations, operation_name)?;
    let (kind, name, position, variable_definitions, directives, selection_set) = match operation {
        OperationDefinition::SelectionSet(selection_set) => (
            OperationKind::Query,
            None,
            selection_set.span.0,
            Vec::new(),
            Vec::new(),
            selection_set,
        ),
        OperationDefinition::Query(q) => (
            OperationKind::Query,
            q.name,
            q.position,
            q.variable_definitions,
            q.directives,
            q.selection_set,
        ),
        OperationDefinition::Mutation(m) => (
            OperationKind::Mutation,
            m.name,
            m.position,
            m.variable_definitions,
            m.directives,
            m.selection_set,
        ),
        OperationDefinition::Subscription(s) => (
            OperationKind::Subscription,
            s.name,
            s.position,
            s.variable_definitions,
            s.directives,
            s.selection_set,
        ),
    };

    let mut visiting = Vec::new();
    let selection_set = inline_fragments(selection_set, &fragments, &mut visiting)?;

    let mut used = HashSet::new();
    collect_selection_variables(&selection_set, &mut used);
    for directive in &directives {
        for (_, value) in &directive.arguments {
            collect_value_variables(value, &mut used);
        }
    }
    let variable_definitions = variable_definitions
        .into_iter()
        .filter(|definition| used.contains(&definition.name))
        .collect();

    Ok(NormalizedOperation {
        kind,
        name,
        position,
        variable_definitions,
        directives,
        selection_set,
    })
}

fn select_operation<'a>(
    operations: Vec<OperationDefinition<'a, String>>,
    operation_name: Option<&str>,
) -> Result<OperationDefinition<'a, String>> {
    match operation_name.filter(|name| !name.is_empty()) {
        Some(wanted) => operations
            .into_iter()
            .find(|operation| operation_name_of(operation) == Some(wanted))
            .ok_or_else(|| Error::InvalidRequest(format!("unknown operation named \"{}\"", wanted))),
        None => {
            if operations.len() > 1 {
                return Err(Error::InvalidRequest(
                    "operation name is required when the document contains multiple operations"
                        .to_string(),
                ));
            }
            operations
                .into_iter()
                .next()
                .ok_or_else(|| Error::InvalidRequest("document contains no operation".to_string()))
        }
    }
}

fn operation_name_of<'a, 'b>(operation: &'b OperationDefinition<'a, String>) -> Option<&'b str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

/// Literal `@skip(if: true)` / `@include(if: false)` remove the selection entirely
fn statically_excluded<'a>(directives: &[Directive<'a, String>]) -> bool {
    directives.iter().any(|directive| {
        let condition = directive
            .arguments
            .iter()
            .find(|(name, _)| name == "if")
            .map(|(_, value)| value);
        match (directive.name.as_str(), condition) {
            ("skip", Some(Value::Boolean(true))) => true,
            ("include", Some(Value::Boolean(false))) => true,
            _ => false,
        }
    })
}

/// Drop `@skip(if: false)` / `@include(if: true)`, which are no-ops
fn strip_static_conditions<'a>(directives: Vec<Directive<'a, String>>) -> Vec<Directive<'a, String>> {
    directives
        .into_iter()
        .filter(|directive| {
            let literal = directive
                .arguments
                .iter()
                .any(|(name, value)| name == "if" && matches!(value, Value::Boolean(_)));
            !(literal && (directive.name == "skip" || directive.name == "include"))
        })
        .collect()
}

fn inline_fragments<'a>(
    selection_set: SelectionSet<'a, String>,
    fragments: &HashMap<String, FragmentDefinition<'a, String>>,
    visiting: &mut Vec<String>,
) -> Result<SelectionSet<'a, String>> {
    let mut items = Vec::with_capacity(selection_set.items.len());
    for selection in selection_set.items {
        match selection {
            Selection::Field(field) => {
                if statically_excluded(&field.directives) {
                    continue;
                }
                let selection_set = inline_fragments(field.selection_set, fragments, visiting)?;
                items.push(Selection::Field(Field {
                    directives: strip_static_conditions(field.directives),
                    selection_set,
                    ..field
                }));
            }
            Selection::FragmentSpread(spread) => {
                if statically_excluded(&spread.directives) {
                    continue;
                }
                let fragment = fragments.get(&spread.fragment_name).ok_or_else(|| {
                    Error::Validation(vec![
                        GraphQLError::new(format!("Unknown fragment \"{}\".", spread.fragment_name))
                            .at(spread.position),
                    ])
                })?;
                if visiting.contains(&spread.fragment_name) {
                    return Err(Error::Validation(vec![
                        GraphQLError::new(format!(
                            "Cannot spread fragment \"{}\" within itself.",
                            spread.fragment_name
                        ))
                        .at(spread.position),
                    ]));
                }
                visiting.push(spread.fragment_name.clone());
                let selection_set =
                    inline_fragments(fragment.selection_set.clone(), fragments, visiting)?;
                visiting.pop();
                push_inline(
                    &mut items,
                    InlineFragment {
                        position: spread.position,
                        type_condition: Some(fragment.type_condition.clone()),
                        directives: strip_static_conditions(spread.directives),
                        selection_set,
                    },
                );
            }
            Selection::InlineFragment(fragment) => {
                if statically_excluded(&fragment.directives) {
                    continue;
                }
                let selection_set = inline_fragments(fragment.selection_set, fragments, visiting)?;
                push_inline(
                    &mut items,
                    InlineFragment {
                        position: fragment.position,
                        type_condition: fragment.type_condition,
                        directives: strip_static_conditions(fragment.directives),
                        selection_set,
                    },
                );
            }
        }
    }
    Ok(SelectionSet {
        span: selection_set.span,
        items,
    })
}

/// Fragments without a type condition or directives are flattened into their parent
fn push_inline<'a>(items: &mut Vec<Selection<'a, String>>, fragment: InlineFragment<'a, String>) {
    if fragment.type_condition.is_none() && fragment.directives.is_empty() {
        items.extend(fragment.selection_set.items);
    } else {
        items.push(Selection::InlineFragment(fragment));
    }
}

pub(crate) fn collect_selection_variables<'a>(selection_set: &SelectionSet<'a, String>, used: &mut HashSet<String>) {
    for selection in &selection_set.items {
        match selection {
            Selection::Field(field) => {
                for (_, value) in &field.arguments {
                    collect_value_variables(value, used);
                }
                collect_directive_variables(&field.directives, used);
                collect_selection_variables(&field.selection_set, used);
            }
            Selection::InlineFragment(fragment) => {
                collect_directive_variables(&fragment.directives, used);
                collect_selection_variables(&fragment.selection_set, used);
            }
            Selection::FragmentSpread(spread) => {
                collect_directive_variables(&spread.directives, used);
            }
        }
    }
}

fn collect_directive_variables<'a>(directives: &[Directive<'a, String>], used: &mut HashSet<String>) {
    for directive in directives {
        for (_, value) in &directive.arguments {
            collect_value_variables(value, used);
        }
    }
}

pub(crate) fn collect_value_variables<'a>(value: &Value<'a, String>, used: &mut HashSet<String>) {
    match value {
        Value::Variable(name) => {
            used.insert(name.clone());
        }
        Value::List(items) => items.iter().for_each(|item| collect_value_variables(item, used)),
        Value::Object(fields) => fields
            .values()
            .for_each(|field| collect_value_variables(field, used)),
        _ => {}
    }
}

/// Lift literal field arguments into variables.
///
/// Arguments whose type is unknown (introspection fields, fields the schema does not have)
/// stay literal; validation reports the latter.
pub fn extract_variables<'a>(
    operation: &mut NormalizedOperation<'a>,
    schema: &SchemaModel,
    variables: &mut Map<String, Json>,
) {
    let Some(root) = schema.root_type(operation.kind).map(str::to_string) else {
        return;
    };
    let mut names = VariableNames::new(
        operation
            .variable_definitions
            .iter()
            .map(|definition| definition.name.clone())
            .chain(variables.keys().cloned())
            .collect(),
    );
    let mut extracted = Vec::new();
    extract_in_selection_set(
        &mut operation.selection_set,
        &root,
        schema,
        variables,
        &mut names,
        &mut extracted,
    );
    operation.variable_definitions.extend(extracted);
}

fn extract_in_selection_set<'a>(
    selection_set: &mut SelectionSet<'a, String>,
    parent: &str,
    schema: &SchemaModel,
    variables: &mut Map<String, Json>,
    names: &mut VariableNames,
    extracted: &mut Vec<VariableDefinition<'a, String>>,
) {
    for selection in &mut selection_set.items {
        match selection {
            Selection::Field(field) => {
                let Some(definition) = schema.field(parent, &field.name) else {
                    continue;
                };
                for (arg_name, value) in &mut field.arguments {
                    if contains_variable(value) {
                        continue;
                    }
                    let Some(arg) = definition.arg(arg_name) else {
                        continue;
                    };
                    let name = names.next();
                    variables.insert(name.clone(), value_to_json(value, &Map::new()));
                    extracted.push(VariableDefinition {
                        position: field.position,
                        name: name.clone(),
                        var_type: arg.ty.to_ast(),
                        default_value: None,
                    });
                    *value = Value::Variable(name);
                }
                let child = definition.ty.named().to_string();
                extract_in_selection_set(&mut field.selection_set, &child, schema, variables, names, extracted);
            }
            Selection::InlineFragment(fragment) => {
                let condition = match &fragment.type_condition {
                    Some(TypeCondition::On(name)) => name.clone(),
                    None => parent.to_string(),
                };
                extract_in_selection_set(&mut fragment.selection_set, &condition, schema, variables, names, extracted);
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

/// Generates `a`, `b`, ... `z`, `aa`, `ab`, ... skipping names already taken
struct VariableNames {
    taken: HashSet<String>,
    counter: usize,
}

impl VariableNames {
    fn new(taken: HashSet<String>) -> Self {
        Self { taken, counter: 0 }
    }

    fn next(&mut self) -> String {
        loop {
            let mut n = self.counter;
            self.counter += 1;
            let mut name = Vec::new();
            loop {
                name.push(b'a' + (n % 26) as u8);
                if n < 26 {
                    break;
                }
                n = n / 26 - 1;
            }
            name.reverse();
            let name = String::from_utf8(name).unwrap_or_default();
            if self.taken.insert(name.clone()) {
                return name;
            }
        }
    }
}
