use std::fs;

use tempfile::tempdir;

use cubeflow::load_schema;
use cubeflow::registry::CubeRegistry;

const USERS: &str = r#"
name: Users
sql_table: public.users
dimensions:
  id: { type: number, sql: "${CUBE}.id", primary_key: true }
  country: { type: string, sql: "${CUBE}.country" }
"#;

const ORDERS: &str = r#"
cubes:
  - name: Orders
    sql_table: public.orders
    measures:
      count: { type: count }
    dimensions:
      status: { type: string, sql: "${CUBE}.status" }
    joins:
      Users: { relationship: belongsTo, sql: "${CUBE}.user_id = ${Users}.id" }
  - name: CompletedOrders
    extends: Orders
    sql: "SELECT * FROM public.orders WHERE status = 'completed'"
"#;

#[test]
fn loads_cubes_in_file_order() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("b_users.yml"), USERS).unwrap();
    fs::write(dir.path().join("a_orders.yaml"), ORDERS).unwrap();
    fs::write(dir.path().join("notes.txt"), "not a cube").unwrap();

    let registry = CubeRegistry::load_from_dir(dir.path()).unwrap();
    let names: Vec<&str> = registry.cubes().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Orders", "CompletedOrders", "Users"]);

    let completed = registry.get("CompletedOrders").unwrap();
    assert!(completed.measures.contains_key("count"));
    assert!(completed.joins.contains_key("Users"));
    assert_eq!(completed.sql_table, None);
}

#[test]
fn duplicate_cube_across_files_is_rejected() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("one.yml"), USERS).unwrap();
    fs::write(dir.path().join("two.yml"), USERS).unwrap();

    let err = CubeRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(err.to_string().contains("'Users' is defined more than once"), "{err}");
}

#[test]
fn invalid_yaml_names_the_file() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("broken.yml"), "name: [unterminated").unwrap();

    let err = CubeRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(err.to_string().contains("broken.yml"), "{err}");
}

#[test]
fn missing_directory_is_an_error() {
    let dir = tempdir().unwrap();
    let err = CubeRegistry::load_from_dir(dir.path().join("nope")).unwrap_err();
    assert!(err.to_string().contains("cube directory not found"));
}

#[test]
fn load_schema_compiles_the_directory() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("orders.yml"), ORDERS).unwrap();
    fs::write(dir.path().join("users.yml"), USERS).unwrap();

    let schema = load_schema(dir.path()).unwrap();
    assert!(schema.cube("CompletedOrders").is_ok());
    assert!(schema.join_graph().connected("Orders", "Users"));
}

#[test]
fn unknown_member_reference_fails_schema_build() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("orders.yml"),
        r#"
name: Orders
sql_table: orders
measures:
  ratio: { type: number, sql: "${count} / 2" }
"#,
    )
    .unwrap();

    let err = load_schema(dir.path()).unwrap_err();
    assert!(err.to_string().contains("count"), "{err}");
}
