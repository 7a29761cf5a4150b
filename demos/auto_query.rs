use model_query::backend::Dialect;
use model_query::builder::SelectBuilder;
use model_query::logging::format_sql;
use model_query::model::{Association, Attribute, ModelBuilder};
use model_query::query::{auto_count_query, auto_query};
use model_query::schema::{Registry, SqlType};
use serde_json::json;

fn main() -> model_query::Result<()> {
    let mut registry = Registry::new();

    registry.register(
        ModelBuilder::table("Order")
            .attribute(Attribute::new("id", SqlType::Integer).primary_key().auto_increment())
            .attribute(Attribute::new("total", SqlType::Integer))
            .attribute(Attribute::new("meta", SqlType::Json))
            .association(Association::has_many("lines", "OrderLine", "orderId"))
            .build()?,
    )?;

    registry.register(
        ModelBuilder::table("OrderLine")
            .attribute(Attribute::new("id", SqlType::Integer).primary_key().auto_increment())
            .attribute(Attribute::new("orderId", SqlType::Integer).references("Order", "id"))
            .attribute(Attribute::new("qty", SqlType::Integer))
            .association(Association::belongs_to("order", "Order", "orderId"))
            .build()?,
    )?;

    let fields = json!({
        "total": ">=10",
        "lines": { "qty": { "$between": [1, 5] } }
    });
    let merge = [json!({
        "where": { "meta.channel": "web" },
        "order": [["total", "DESC"]],
        "limit": 20
    })];

    let options = auto_query(&registry, "Order", &fields, &merge)?;
    println!("Find options:");
    println!("{}", serde_json::to_string_pretty(&options)?);

    let order = registry.model("Order")?;
    for dialect in [Dialect::Sqlite, Dialect::Postgres] {
        let sql = SelectBuilder::new(&registry, order, &options, dialect).build()?;
        println!("\n-- {} --", dialect);
        println!("{}", format_sql(&sql));
    }

    let count = auto_count_query(&registry, "Order", &fields, &[])?;
    let sql = SelectBuilder::new(&registry, order, &count, Dialect::Postgres).build_count()?;
    println!("\n-- count --");
    println!("{}", format_sql(&sql));

    Ok(())
}
