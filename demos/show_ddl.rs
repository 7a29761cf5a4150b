use model_query::backend::Dialect;
use model_query::model::{Association, Attribute, IndexMethod, IndexOptions, ModelBuilder};
use model_query::schema::{Registry, SqlType};
use model_query::view;

fn main() -> model_query::Result<()> {
    let mut registry = Registry::new();

    registry.register(
        ModelBuilder::table("Customer")
            .attribute(Attribute::new("id", SqlType::Integer).primary_key().auto_increment())
            .attribute(Attribute::new("email", SqlType::Varchar(255)).not_null().unique())
            .attribute(Attribute::new("profile", SqlType::Json))
            .association(Association::has_many("orders", "Order", "customerId"))
            .build()?,
    )?;

    registry.register(
        ModelBuilder::table("Order")
            .attribute(Attribute::new("id", SqlType::Integer).primary_key().auto_increment())
            .attribute(Attribute::new("customerId", SqlType::Integer).references("Customer", "id"))
            .attribute(Attribute::new("total", SqlType::Numeric).default_value("0"))
            .attribute(Attribute::new("placedAt", SqlType::Timestamp))
            .index(
                "placedAt",
                IndexOptions {
                    method: Some(IndexMethod::Btree),
                    ..Default::default()
                },
            )
            .nullable_index("customerId", IndexOptions::default())
            .build()?,
    )?;

    registry.register(
        ModelBuilder::dynamic_view(
            "RecentOrders",
            r#"CREATE VIEW "RecentOrders" AS
               SELECT * FROM "Order" WHERE "placedAt" > @{since}"#,
        )
        .attribute(Attribute::new("id", SqlType::Integer).primary_key())
        .view_param("since", "2024-01-01")
        .build()?,
    )?;

    for dialect in [Dialect::Sqlite, Dialect::Postgres] {
        println!("-- {} --", dialect);
        let ddl = registry.generate_ddl(dialect);
        for (i, statement) in ddl.split(";").map(str::trim).filter(|s| !s.is_empty()).enumerate() {
            println!("Statement {}:", i);
            println!("{}", statement);
            println!("---");
        }

        for model in registry.views() {
            println!("{};", view::view_definition(model, None, false)?);
        }
        println!();
    }

    Ok(())
}
