//! Walks the model and produces the dynamic GraphQL type system: one node
//! type per table, the `database` query root (list + aggregate fields, one
//! field per read-only stored procedure), the `databaseInput` mutation root
//! (insert/update/delete per base table, mutating procedures), filter and
//! sort input types, and stored-procedure input/result types.

use std::sync::Arc;

use async_graphql::dynamic::{
    Enum, Field, InputObject, InputValue, Object, Scalar, Schema, SchemaBuilder, TypeRef,
};
use tracing::{debug, info};

use crate::dialect::Dialect;
use crate::graphql::{mutations, resolvers};
use crate::model::{META_SOFT_DELETE, Model, StoredProc, Table};
use crate::typemap::{
    self, SCALAR_BOOLEAN, SCALAR_DATETIME, SCALAR_FLOAT, SCALAR_INT, SCALAR_JSON, SCALAR_STRING,
};

fn node_name(table: &Table) -> String {
    format!("{}_node", table.graphql_name)
}

fn filter_name(table: &Table) -> String {
    format!("{}_filter", table.graphql_name)
}

fn sort_name(table: &Table) -> String {
    format!("{}_sort", table.graphql_name)
}

fn join_name(table: &Table) -> String {
    format!("{}_join", table.graphql_name)
}

fn scalar_filter_name(scalar: &str) -> String {
    format!("{}_filter", scalar.to_lowercase())
}

/// Builds the full schema for a model. The caller attaches execution data
/// (executor, transformer service, loaders) and finishes the builder.
pub fn generate_schema(model: &Arc<Model>, dialect: Dialect) -> SchemaBuilder {
    let mut query_root = Object::new("database");
    let mut mutation_root = Object::new("databaseInput");
    let mut has_mutations = false;

    let mut objects: Vec<Object> = Vec::new();
    let mut inputs: Vec<InputObject> = Vec::new();
    let mut enums: Vec<Enum> = Vec::new();

    info!(
        tables = model.tables().count(),
        procs = model.procs().count(),
        "generating GraphQL schema"
    );

    for table in model.tables() {
        debug!(table = %table.key(), "generating types");
        objects.push(node_object(model, table, dialect));
        objects.push(aggregate_object(table));
        inputs.push(filter_input(table, dialect));
        enums.push(sort_enum(table));
        if model.dynamic_joins() && has_links(table) {
            enums.push(join_enum(table));
        }

        query_root = query_root
            .field(list_field(model, table))
            .field(aggregate_field(table));

        if !table.is_view() {
            let (insert_input, insert) = insert_mutation(model, table, dialect);
            inputs.push(insert_input);
            mutation_root = mutation_root.field(insert);
            has_mutations = true;

            if !table.primary_keys().is_empty() {
                let (update_input, update) = update_mutation(model, table, dialect);
                inputs.push(update_input);
                mutation_root = mutation_root.field(update);
                mutation_root = mutation_root.field(delete_mutation(table, dialect));
            }
        }
    }

    for (index, proc) in model.procs().enumerate() {
        let (proc_inputs, result, field) = proc_types(proc, dialect, index);
        inputs.extend(proc_inputs);
        objects.push(result);
        if proc.is_read_only {
            query_root = query_root.field(field);
        } else {
            mutation_root = mutation_root.field(field);
            has_mutations = true;
        }
    }

    let mutation_name = has_mutations.then(|| mutation_root.type_name().to_string());
    let mut builder = Schema::build(query_root.type_name(), mutation_name.as_deref(), None)
        .register(Scalar::new(SCALAR_DATETIME))
        .register(Scalar::new(SCALAR_JSON))
        .register(query_root);

    if has_mutations {
        builder = builder.register(mutation_root);
    }
    for input in scalar_filter_inputs() {
        builder = builder.register(input);
    }
    for object in objects {
        builder = builder.register(object);
    }
    for input in inputs {
        builder = builder.register(input);
    }
    for item in enums {
        builder = builder.register(item);
    }

    builder
}

fn has_links(table: &Table) -> bool {
    !table.single_links.is_empty() || !table.multi_links.is_empty()
}

fn column_type_ref(column: &crate::model::Column, dialect: Dialect) -> TypeRef {
    let scalar = typemap::graphql_type(dialect, &column.data_type);
    if column.is_nullable {
        TypeRef::named(scalar)
    } else {
        TypeRef::named_nn(scalar)
    }
}

fn node_object(model: &Model, table: &Table, dialect: Dialect) -> Object {
    let mut object = Object::new(node_name(table));

    for column in table.columns() {
        let db_name = column.db_name.clone();
        object = object.field(Field::new(
            column.graphql_name.clone(),
            column_type_ref(column, dialect),
            move |ctx| resolvers::column_resolver(db_name.clone(), ctx),
        ));
    }

    for link in table.single_links.values() {
        let Some(parent) = model.table(&format!("{}.{}", link.parent_schema, link.parent_table))
        else {
            continue;
        };
        let link = link.clone();
        object = object.field(Field::new(
            link.name.clone(),
            TypeRef::named(node_name(parent)),
            move |ctx| resolvers::single_link_resolver(link.clone(), ctx),
        ));
    }

    for link in table.multi_links.values() {
        let Some(child) = model.table(&format!("{}.{}", link.child_schema, link.child_table))
        else {
            continue;
        };
        let link = link.clone();
        object = object.field(Field::new(
            link.name.clone(),
            TypeRef::named_nn_list_nn(node_name(child)),
            move |ctx| resolvers::multi_link_resolver(link.clone(), ctx),
        ));
    }

    object
}

fn aggregate_object(table: &Table) -> Object {
    Object::new(format!("{}_aggregate_result", table.graphql_name)).field(Field::new(
        "count",
        TypeRef::named_nn(TypeRef::INT),
        |ctx| resolvers::column_resolver("count".to_string(), ctx),
    ))
}

fn filter_input(table: &Table, dialect: Dialect) -> InputObject {
    let name = filter_name(table);
    let mut input = InputObject::new(name.clone());
    for column in table.columns() {
        let scalar = typemap::graphql_type(dialect, &column.data_type);
        input = input.field(InputValue::new(
            column.graphql_name.clone(),
            TypeRef::named(scalar_filter_name(scalar)),
        ));
    }
    input
        .field(InputValue::new("_and", TypeRef::named_nn_list(name.clone())))
        .field(InputValue::new("_or", TypeRef::named_nn_list(name)))
}

fn sort_enum(table: &Table) -> Enum {
    let mut sort = Enum::new(sort_name(table));
    for column in table.columns() {
        sort = sort
            .item(format!("{}_asc", column.graphql_name))
            .item(format!("{}_desc", column.graphql_name));
    }
    sort
}

fn join_enum(table: &Table) -> Enum {
    let mut joins = Enum::new(join_name(table));
    for name in table
        .single_links
        .keys()
        .chain(table.multi_links.keys())
    {
        joins = joins.item(name.clone());
    }
    joins
}

fn list_field(model: &Model, table: &Table) -> Field {
    let table_key = table.key();
    let mut field = Field::new(
        table.graphql_name.clone(),
        TypeRef::named_nn_list_nn(node_name(table)),
        move |ctx| resolvers::list_resolver(table_key.clone(), ctx),
    )
    .argument(InputValue::new("filter", TypeRef::named(filter_name(table))))
    .argument(InputValue::new(
        "sort",
        TypeRef::named_nn_list(sort_name(table)),
    ))
    .argument(InputValue::new("limit", TypeRef::named(TypeRef::INT)))
    .argument(InputValue::new("offset", TypeRef::named(TypeRef::INT)));

    if table.metadata(META_SOFT_DELETE).is_some() {
        field = field.argument(InputValue::new(
            "_includeDeleted",
            TypeRef::named(TypeRef::BOOLEAN),
        ));
    }
    if model.dynamic_joins() && has_links(table) {
        field = field.argument(InputValue::new(
            "_join",
            TypeRef::named_nn_list(join_name(table)),
        ));
    }
    field
}

fn aggregate_field(table: &Table) -> Field {
    let table_key = table.key();
    let mut field = Field::new(
        format!("{}_aggregate", table.graphql_name),
        TypeRef::named_nn(format!("{}_aggregate_result", table.graphql_name)),
        move |ctx| resolvers::aggregate_resolver(table_key.clone(), ctx),
    )
    .argument(InputValue::new("filter", TypeRef::named(filter_name(table))));

    if table.metadata(META_SOFT_DELETE).is_some() {
        field = field.argument(InputValue::new(
            "_includeDeleted",
            TypeRef::named(TypeRef::BOOLEAN),
        ));
    }
    field
}

fn insert_mutation(model: &Model, table: &Table, dialect: Dialect) -> (InputObject, Field) {
    let input_name = format!("insert_{}_input", table.graphql_name);
    let mut input = InputObject::new(input_name.clone());

    for column in table.columns() {
        if column.is_identity {
            continue;
        }
        // FK columns stay optional: a nested child insert gets its key
        // filled from the freshly generated parent identity.
        let is_fk = table
            .single_links
            .values()
            .any(|link| link.child_column.eq_ignore_ascii_case(&column.db_name));
        let scalar = typemap::graphql_type(dialect, &column.data_type);
        let type_ref = if column.is_nullable || is_fk {
            TypeRef::named(scalar)
        } else {
            TypeRef::named_nn(scalar)
        };
        input = input.field(InputValue::new(column.graphql_name.clone(), type_ref));
    }
    for (link_name, link) in &table.multi_links {
        if let Some(child) = model.table(&format!("{}.{}", link.child_schema, link.child_table)) {
            input = input.field(InputValue::new(
                link_name.clone(),
                TypeRef::named_nn_list(format!("insert_{}_input", child.graphql_name)),
            ));
        }
    }

    let table_key = table.key();
    let field = Field::new(
        format!("insert_{}", table.graphql_name),
        TypeRef::named(node_name(table)),
        move |ctx| mutations::insert_resolver(table_key.clone(), ctx),
    )
    .argument(InputValue::new("value", TypeRef::named_nn(input_name)));

    (input, field)
}

fn update_mutation(model: &Model, table: &Table, dialect: Dialect) -> (InputObject, Field) {
    let input_name = format!("update_{}_input", table.graphql_name);
    let mut input = InputObject::new(input_name.clone());

    // Every column optional; nested children may be brand new rows, so the
    // key requirement is enforced at the root by the resolver.
    for column in table.columns() {
        let scalar = typemap::graphql_type(dialect, &column.data_type);
        input = input.field(InputValue::new(
            column.graphql_name.clone(),
            TypeRef::named(scalar),
        ));
    }
    for (link_name, link) in &table.multi_links {
        if let Some(child) = model.table(&format!("{}.{}", link.child_schema, link.child_table)) {
            input = input.field(InputValue::new(
                link_name.clone(),
                TypeRef::named_nn_list(format!("update_{}_input", child.graphql_name)),
            ));
        }
    }

    let table_key = table.key();
    let field = Field::new(
        format!("update_{}", table.graphql_name),
        TypeRef::named(node_name(table)),
        move |ctx| mutations::update_resolver(table_key.clone(), ctx),
    )
    .argument(InputValue::new("value", TypeRef::named_nn(input_name)));

    (input, field)
}

fn delete_mutation(table: &Table, dialect: Dialect) -> Field {
    let table_key = table.key();
    let mut field = Field::new(
        format!("delete_{}", table.graphql_name),
        TypeRef::named_nn(TypeRef::INT),
        move |ctx| mutations::delete_resolver(table_key.clone(), ctx),
    );
    for pk in table.primary_keys() {
        let scalar = typemap::graphql_type(dialect, &pk.data_type);
        field = field.argument(InputValue::new(
            pk.graphql_name.clone(),
            TypeRef::named_nn(scalar),
        ));
    }
    field
}

fn proc_types(
    proc: &StoredProc,
    dialect: Dialect,
    index: usize,
) -> (Vec<InputObject>, Object, Field) {
    let mut inputs = Vec::new();

    let input_params: Vec<_> = proc
        .params
        .iter()
        .filter(|p| p.direction.accepts_input())
        .collect();
    if !input_params.is_empty() {
        let mut input = InputObject::new(proc.input_type_name());
        for param in &input_params {
            let scalar = typemap::graphql_type(dialect, &param.data_type);
            let type_ref = if param.is_nullable {
                TypeRef::named(scalar)
            } else {
                TypeRef::named_nn(scalar)
            };
            input = input.field(InputValue::new(param.graphql_name.clone(), type_ref));
        }
        inputs.push(input);
    }

    let mut result = Object::new(proc.result_type_name())
        .field(Field::new(
            "resultSets",
            TypeRef::List(Box::new(TypeRef::List(Box::new(TypeRef::Named(
                SCALAR_JSON.into(),
            ))))),
            |ctx| resolvers::column_resolver("resultSets".to_string(), ctx),
        ))
        .field(Field::new(
            "affectedRows",
            TypeRef::named_nn(TypeRef::INT),
            |ctx| resolvers::column_resolver("affectedRows".to_string(), ctx),
        ));
    for param in &proc.params {
        if param.direction.produces_output() {
            let scalar = typemap::graphql_type(dialect, &param.data_type);
            let name = param.graphql_name.clone();
            result = result.field(Field::new(
                name.clone(),
                TypeRef::named(scalar),
                move |ctx| resolvers::column_resolver(name.clone(), ctx),
            ));
        }
    }

    let mut field = Field::new(
        proc.full_graphql_name(),
        TypeRef::named_nn(proc.result_type_name()),
        move |ctx| resolvers::proc_resolver(index, ctx),
    );
    if !input_params.is_empty() {
        field = field.argument(InputValue::new(
            "input",
            TypeRef::named(proc.input_type_name()),
        ));
    }

    (inputs, result, field)
}

fn scalar_filter_inputs() -> Vec<InputObject> {
    let mut all = Vec::new();
    for scalar in [SCALAR_STRING, SCALAR_INT, SCALAR_FLOAT, SCALAR_DATETIME] {
        let mut input = InputObject::new(scalar_filter_name(scalar))
            .field(InputValue::new("_eq", TypeRef::named(scalar)))
            .field(InputValue::new("_neq", TypeRef::named(scalar)))
            .field(InputValue::new("_gt", TypeRef::named(scalar)))
            .field(InputValue::new("_lt", TypeRef::named(scalar)))
            .field(InputValue::new("_gte", TypeRef::named(scalar)))
            .field(InputValue::new("_lte", TypeRef::named(scalar)))
            .field(InputValue::new("_in", TypeRef::named_nn_list(scalar)))
            .field(InputValue::new("_between", TypeRef::named_nn_list(scalar)));
        if scalar == SCALAR_STRING || scalar == SCALAR_DATETIME {
            input = input
                .field(InputValue::new("_contains", TypeRef::named(SCALAR_STRING)))
                .field(InputValue::new(
                    "_starts_with",
                    TypeRef::named(SCALAR_STRING),
                ))
                .field(InputValue::new("_ends_with", TypeRef::named(SCALAR_STRING)));
        }
        all.push(input);
    }
    all.push(
        InputObject::new(scalar_filter_name(SCALAR_BOOLEAN))
            .field(InputValue::new("_eq", TypeRef::named(SCALAR_BOOLEAN)))
            .field(InputValue::new("_neq", TypeRef::named(SCALAR_BOOLEAN))),
    );
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataFile;
    use crate::schema::test_fixtures::shop_schema;

    fn sdl_for(metadata: &str) -> String {
        let meta = MetadataFile::parse(metadata).unwrap();
        let model = Arc::new(Model::build(shop_schema(), &meta).unwrap());
        generate_schema(&model, Dialect::Sqlite)
            .finish()
            .expect("schema should build")
            .sdl()
    }

    #[test]
    fn generates_roots_tables_and_crud_fields() {
        let sdl = sdl_for("");
        assert!(sdl.contains("type database"));
        assert!(sdl.contains("type databaseInput"));
        assert!(sdl.contains("type users_node"));
        assert!(sdl.contains("type orders_node"));
        assert!(sdl.contains("insert_users"));
        assert!(sdl.contains("update_orders"));
        assert!(sdl.contains("delete_orders"));
        assert!(sdl.contains("users_aggregate"));
        assert!(sdl.contains("input users_filter"));
        assert!(sdl.contains("enum users_sort"));
    }

    #[test]
    fn link_fields_appear_on_both_sides() {
        let sdl = sdl_for("");
        // Users.orders: [orders_node!]! and Orders.users: users_node
        assert!(sdl.contains("orders: [orders_node!]!"));
        assert!(sdl.contains("users: users_node"));
    }

    #[test]
    fn soft_delete_tables_expose_include_deleted() {
        let sdl = sdl_for("[tables.Users]\nsoft-delete = \"deleted_at\"\n");
        assert!(sdl.contains("_includeDeleted"));
    }

    #[test]
    fn plain_tables_do_not_expose_include_deleted() {
        let sdl = sdl_for("");
        assert!(!sdl.contains("_includeDeleted"));
    }

    #[test]
    fn identity_columns_are_excluded_from_insert_input() {
        let sdl = sdl_for("");
        let input = sdl
            .split("input insert_users_input")
            .nth(1)
            .and_then(|rest| rest.split('}').next())
            .expect("insert input present");
        assert!(!input.contains("id:"));
        assert!(input.contains("name: String!"));
    }

    #[test]
    fn dynamic_joins_flag_gates_the_join_argument() {
        let with = sdl_for("");
        assert!(with.contains("_join"));
        let without = sdl_for("[model]\ndynamic-joins = false\n");
        assert!(!without.contains("_join"));
    }

    #[test]
    fn nested_insert_inputs_accept_child_collections() {
        let sdl = sdl_for("");
        let input = sdl
            .split("input insert_users_input")
            .nth(1)
            .and_then(|rest| rest.split('}').next())
            .expect("insert input present");
        assert!(input.contains("orders: [insert_orders_input!]"));
    }
}
