use crate::{
    expr::{ExprBuilder, Filter, FilterOp, KeyCondition, QueryError, SortCondition},
    field::FieldDef,
    schema::EntityDef,
    store::Scalar,
    value::Value,
};

///
/// Filter / condition compilation
///
/// Walks the AST against one entity definition and emits the backend's
/// expression string. Operand scalars are produced by each field's storage
/// encoder, so compiled values always match what the attribute holds.
///

pub fn compile_filter(
    entity: &EntityDef,
    filter: &Filter,
    builder: &mut ExprBuilder,
) -> Result<String, QueryError> {
    match filter {
        Filter::And(terms) => compile_group(entity, terms, "AND", "$and", builder),
        Filter::Or(terms) => compile_group(entity, terms, "OR", "$or", builder),
        Filter::Not(inner) => {
            let compiled = compile_filter(entity, inner, builder)?;
            Ok(format!("NOT ({compiled})"))
        }
        Filter::Cond(field, op) => compile_condition(entity, field, op, builder),
    }
}

fn compile_group(
    entity: &EntityDef,
    terms: &[Filter],
    keyword: &str,
    operator: &'static str,
    builder: &mut ExprBuilder,
) -> Result<String, QueryError> {
    if terms.is_empty() {
        return Err(QueryError::EmptyGroup { operator });
    }

    let compiled = terms
        .iter()
        .map(|term| compile_filter(entity, term, builder))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(format!("({})", compiled.join(&format!(" {keyword} "))))
}

fn compile_condition(
    entity: &EntityDef,
    field: &str,
    op: &FilterOp,
    builder: &mut ExprBuilder,
) -> Result<String, QueryError> {
    let def = entity
        .field_def(field)
        .ok_or_else(|| QueryError::UnknownField {
            entity: entity.name.clone(),
            field: field.to_string(),
        })?;

    let name = builder.bind_name(field);

    let operand = |def: &FieldDef,
                   value: &Value,
                   operator: &'static str,
                   builder: &mut ExprBuilder|
     -> Result<String, QueryError> {
        if value.is_null() {
            return Err(QueryError::InvalidOperand {
                field: def.name.clone(),
                operator,
                message: "null operand".to_string(),
            });
        }
        let scalar = def
            .encode_storage(value)?
            .ok_or_else(|| QueryError::InvalidOperand {
                field: def.name.clone(),
                operator,
                message: "operand encodes to nothing".to_string(),
            })?;
        Ok(builder.bind_value(scalar))
    };

    let compiled = match op {
        FilterOp::Eq(v) => format!("{name} = {}", operand(def, v, op.token(), builder)?),
        FilterOp::Ne(v) => format!("{name} <> {}", operand(def, v, op.token(), builder)?),
        FilterOp::Gt(v) => format!("{name} > {}", operand(def, v, op.token(), builder)?),
        FilterOp::Gte(v) => format!("{name} >= {}", operand(def, v, op.token(), builder)?),
        FilterOp::Lt(v) => format!("{name} < {}", operand(def, v, op.token(), builder)?),
        FilterOp::Lte(v) => format!("{name} <= {}", operand(def, v, op.token(), builder)?),
        FilterOp::Contains(v) => {
            format!("contains({name}, {})", operand(def, v, op.token(), builder)?)
        }
        FilterOp::BeginsWith(v) => {
            format!(
                "begins_with({name}, {})",
                operand(def, v, op.token(), builder)?
            )
        }
        FilterOp::In(values) => {
            if values.is_empty() {
                return Err(QueryError::InvalidOperand {
                    field: field.to_string(),
                    operator: op.token(),
                    message: "requires a non-empty array".to_string(),
                });
            }
            let placeholders = values
                .iter()
                .map(|v| operand(def, v, op.token(), builder))
                .collect::<Result<Vec<_>, _>>()?;
            format!("{name} IN ({})", placeholders.join(", "))
        }
        FilterOp::Exists(true) => format!("attribute_exists({name})"),
        FilterOp::Exists(false) => format!("attribute_not_exists({name})"),
    };

    Ok(compiled)
}

///
/// KeyConditionSpec
///
/// Physical shape of the index being queried: attribute names, the
/// already-composed partition key value, and the declared sort field. The
/// query engine resolves these from the entity definition; compilation only
/// enforces the sort-key constraint and emits the clause.
///

#[derive(Debug)]
pub struct KeyConditionSpec<'a> {
    pub index_name: &'a str,
    pub pk_attr: &'a str,
    pub sk_attr: &'a str,
    pub pk_value: String,
    /// `None` when the sort component is the entity-prefix sentinel, in
    /// which case sort operands must be plain strings.
    pub sort_field: Option<&'a FieldDef>,
    pub sort_field_name: &'a str,
}

pub fn compile_key_condition(
    spec: &KeyConditionSpec<'_>,
    sort: Option<&SortCondition>,
    builder: &mut ExprBuilder,
) -> Result<String, QueryError> {
    let pk_name = builder.bind_name(spec.pk_attr);
    let pk_value = builder.bind_value(Scalar::S(spec.pk_value.clone()));
    let mut compiled = format!("{pk_name} = {pk_value}");

    let Some(sort) = sort else {
        return Ok(compiled);
    };

    if sort.field != spec.sort_field_name {
        return Err(QueryError::NotSortKey {
            field: sort.field.clone(),
            index: spec.index_name.to_string(),
        });
    }

    let operand = |value: &Value, builder: &mut ExprBuilder| -> Result<String, QueryError> {
        let encoded = match spec.sort_field {
            Some(def) => def.encode_index(value)?,
            None => value
                .as_str()
                .map(ToString::to_string)
                .ok_or_else(|| QueryError::InvalidOperand {
                    field: sort.field.clone(),
                    operator: sort.condition.token(),
                    message: "prefix-keyed sort accepts only strings".to_string(),
                })?,
        };
        Ok(builder.bind_value(Scalar::S(encoded)))
    };

    let sk_name = builder.bind_name(spec.sk_attr);
    let clause = match &sort.condition {
        KeyCondition::Eq(v) => format!("{sk_name} = {}", operand(v, builder)?),
        KeyCondition::Lt(v) => format!("{sk_name} < {}", operand(v, builder)?),
        KeyCondition::Lte(v) => format!("{sk_name} <= {}", operand(v, builder)?),
        KeyCondition::Gt(v) => format!("{sk_name} > {}", operand(v, builder)?),
        KeyCondition::Gte(v) => format!("{sk_name} >= {}", operand(v, builder)?),
        KeyCondition::BeginsWith(v) => {
            format!("begins_with({sk_name}, {})", operand(v, builder)?)
        }
        KeyCondition::Between(low, high) => {
            let low = operand(low, builder)?;
            let high = operand(high, builder)?;
            format!("{sk_name} BETWEEN {low} AND {high}")
        }
    };

    compiled.push_str(" AND ");
    compiled.push_str(&clause);

    Ok(compiled)
}
