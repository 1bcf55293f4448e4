use crate::utils::{session_for, setup_tracing, start_nodes};
use assert_matches::assert_matches;
use bytes::Bytes;
use cassandra_native::errors::{BadQuery, DbError, ExecutionError, InvariantViolation};
use cassandra_native::frame::request::RequestOpcode;
use cassandra_native::frame::response::error::Error;
use cassandra_native::frame::response::event::{SchemaChangeEvent, SchemaChangeType};
use cassandra_native::frame::response::result::{
    self, ColumnSpec, ColumnType, Row, Rows, SchemaChange, TableSpec,
};
use cassandra_native::frame::response::Response;
use cassandra_native::serialize::SerializedValues;
use cassandra_native::statement::Consistency;
use cassandra_native_mock::{Condition, Reaction, RequestRule};

fn two_rows() -> Response {
    let table = TableSpec::new("ks", "t");
    Response::Result(result::Result::Rows(Rows::new(
        vec![
            ColumnSpec::new("a", ColumnType::Int, table.clone()),
            ColumnSpec::new("b", ColumnType::Text, table),
        ],
        vec![
            Row {
                columns: vec![
                    Some(Bytes::copy_from_slice(&1_i32.to_be_bytes())),
                    Some(Bytes::from_static(b"one")),
                ],
            },
            Row {
                columns: vec![Some(Bytes::copy_from_slice(&2_i32.to_be_bytes())), None],
            },
        ],
    )))
}

fn rows_for_select() -> RequestRule {
    RequestRule(
        Condition::body_contains("SELECT"),
        Reaction::Respond(two_rows()),
    )
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn rows_are_decoded() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![rows_for_select()]);
    let session = session_for(std::slice::from_ref(&node)).await;

    let rows = session
        .query("SELECT a, b FROM ks.t", Consistency::One)
        .await
        .unwrap();
    assert_eq!(rows.rows_count, 2);
    assert_eq!(rows.col_specs()[1].name(), "b");
    assert_eq!(rows.rows[0].get::<i32>(0).unwrap(), 1);
    assert_eq!(rows.rows[0].get::<String>(1).unwrap(), "one");
    assert_eq!(rows.rows[1].get::<i32>(0).unwrap(), 2);
    assert_eq!(rows.rows[1].get::<Option<String>>(1).unwrap(), None);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn rows_against_non_query_is_an_invariant_violation() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![rows_for_select()]);
    let session = session_for(std::slice::from_ref(&node)).await;

    let err = session
        .non_query("SELECT a, b FROM ks.t", Consistency::One)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ExecutionError::InvariantViolation(InvariantViolation::UnexpectedOutput {
            expected: "Void or SchemaChange",
            got: "Rows",
        })
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn shapes_of_non_query_and_scalar() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let schema_change = SchemaChange {
        event: SchemaChangeEvent::TableChange {
            change_type: SchemaChangeType::Created,
            keyspace_name: "ks".to_owned(),
            object_name: "t".to_owned(),
        },
    };
    node.set_rules(vec![RequestRule(
        Condition::body_contains("CREATE TABLE"),
        Reaction::Respond(Response::Result(result::Result::SchemaChange(
            schema_change.clone(),
        ))),
    )]);
    let session = session_for(std::slice::from_ref(&node)).await;

    assert_eq!(
        session
            .non_query("INSERT INTO ks.t (a) VALUES (1)", Consistency::One)
            .await
            .unwrap(),
        None
    );
    assert_eq!(
        session
            .non_query("CREATE TABLE ks.t (a int primary key)", Consistency::One)
            .await
            .unwrap(),
        Some(schema_change)
    );
    assert_eq!(
        session.scalar("USE other_ks", Consistency::One).await.unwrap(),
        "other_ks"
    );
    assert_eq!(session.get_keyspace().as_deref(), Some("other_ks"));
    assert_matches!(
        session.scalar("INSERT INTO ks.t (a) VALUES (1)", Consistency::One).await,
        Err(ExecutionError::InvariantViolation(InvariantViolation::UnexpectedOutput {
            expected: "SetKeyspace",
            got: "Void",
        }))
    );
    assert_matches!(
        session.query("INSERT INTO ks.t (a) VALUES (1)", Consistency::One).await,
        Err(ExecutionError::InvariantViolation(_))
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn server_error_is_reported_as_such() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    node.set_rules(vec![RequestRule(
        Condition::body_contains("SELEKT"),
        Reaction::Respond(Response::Error(Error {
            error: DbError::SyntaxError,
            reason: "line 1:0 no viable alternative".to_owned(),
        })),
    )]);
    let session = session_for(std::slice::from_ref(&node)).await;

    assert_matches!(
        session.query("SELEKT * FROM t", Consistency::One).await,
        Err(ExecutionError::DbError(DbError::SyntaxError, reason)) if reason.contains("viable")
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn prepare_and_execute() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let session = session_for(std::slice::from_ref(&node)).await;

    let prepared = session
        .prepare("INSERT INTO ks.t (a, b) VALUES (?, ?)")
        .await
        .unwrap();
    assert_eq!(prepared.get_variable_col_specs().len(), 2);
    assert_eq!(
        prepared.get_statement(),
        "INSERT INTO ks.t (a, b) VALUES (?, ?)"
    );

    let mut values = SerializedValues::new();
    values.add_value(&7_i32).unwrap();
    values.add_value("seven").unwrap();
    assert_eq!(
        session
            .execute_non_query(&prepared, &values, Consistency::Quorum)
            .await
            .unwrap(),
        None
    );

    let executed = node
        .received()
        .into_iter()
        .find(|r| r.request.opcode() == RequestOpcode::Execute)
        .unwrap();
    assert_eq!(
        crate::utils::query_consistency(&executed),
        Some(Consistency::Quorum)
    );

    let mut too_few = SerializedValues::new();
    too_few.add_value(&7_i32).unwrap();
    assert_matches!(
        session
            .execute_non_query(&prepared, &too_few, Consistency::One)
            .await,
        Err(ExecutionError::BadQuery(BadQuery::WrongValuesCount { expected: 2, got: 1 }))
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unprepared_statement_is_reprepared() {
    setup_tracing();
    let [node] = start_nodes::<1>().await;
    let session = session_for(std::slice::from_ref(&node)).await;
    let prepared = session.prepare("SELECT * FROM ks.t").await.unwrap();

    node.set_rules(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Execute).and(Condition::TrueForLimitedTimes(1)),
        Reaction::Respond(Response::Error(Error {
            error: DbError::Unprepared {
                statement_id: prepared.get_id().clone(),
            },
            reason: "unknown statement".to_owned(),
        })),
    )]);

    session
        .execute_non_query(&prepared, &SerializedValues::new(), Consistency::One)
        .await
        .unwrap();

    let prepares = node.count_received(|r| r.request.opcode() == RequestOpcode::Prepare);
    let executes = node.count_received(|r| r.request.opcode() == RequestOpcode::Execute);
    assert_eq!(prepares, 2);
    assert_eq!(executes, 2);
}
