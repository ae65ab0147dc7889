//! Transactions through the proxy.

use mysql::prelude::Queryable;

use super::proxy::spawn_proxy;
use super::{get_mysql_config, should_run_integration_tests};

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_visible_after_transaction() {
    if !should_run_integration_tests() {
        return;
    }
    let config = get_mysql_config();
    let port = spawn_proxy(&config, "readwritesplit").await;
    let url = config.proxy_url(port);

    let value: Option<i64> = tokio::task::spawn_blocking(move || {
        let pool = mysql::Pool::new(url.as_str()).expect("connect through proxy");
        let mut conn = pool.get_conn().expect("get conn");
        conn.query_drop("CREATE TABLE IF NOT EXISTS bifrost_trx (id INT PRIMARY KEY, c INT)")
            .expect("create");
        conn.query_drop("DELETE FROM bifrost_trx").expect("clear");
        conn.query_drop("INSERT INTO bifrost_trx VALUES (5, 0)")
            .expect("seed");

        conn.query_drop("BEGIN").expect("begin");
        conn.query_drop("UPDATE bifrost_trx SET c = c + 1 WHERE id = 5")
            .expect("update");
        let mid: Option<i64> = conn
            .query_first("SELECT c FROM bifrost_trx WHERE id = 5")
            .expect("select inside trx");
        assert_eq!(mid, Some(1));
        conn.query_drop("COMMIT").expect("commit");

        let after: Option<i64> = conn
            .query_first("SELECT c FROM bifrost_trx WHERE id = 5")
            .expect("select after commit");
        conn.query_drop("DROP TABLE bifrost_trx").expect("drop");
        after
    })
    .await
    .expect("join");

    assert_eq!(value, Some(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rollback_discards_changes() {
    if !should_run_integration_tests() {
        return;
    }
    let config = get_mysql_config();
    let port = spawn_proxy(&config, "readwritesplit").await;
    let url = config.proxy_url(port);

    let value: Option<i64> = tokio::task::spawn_blocking(move || {
        let pool = mysql::Pool::new(url.as_str()).expect("connect through proxy");
        let mut conn = pool.get_conn().expect("get conn");
        conn.query_drop("CREATE TABLE IF NOT EXISTS bifrost_rb (id INT PRIMARY KEY, c INT)")
            .expect("create");
        conn.query_drop("DELETE FROM bifrost_rb").expect("clear");
        conn.query_drop("INSERT INTO bifrost_rb VALUES (1, 100)")
            .expect("seed");

        conn.query_drop("BEGIN").expect("begin");
        conn.query_drop("UPDATE bifrost_rb SET c = 0 WHERE id = 1")
            .expect("update");
        conn.query_drop("ROLLBACK").expect("rollback");

        let after: Option<i64> = conn
            .query_first("SELECT c FROM bifrost_rb WHERE id = 1")
            .expect("select after rollback");
        conn.query_drop("DROP TABLE bifrost_rb").expect("drop");
        after
    })
    .await
    .expect("join");

    assert_eq!(value, Some(100));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prepared_statements_through_proxy() {
    if !should_run_integration_tests() {
        return;
    }
    let config = get_mysql_config();
    let port = spawn_proxy(&config, "readwritesplit").await;
    let url = config.proxy_url(port);

    let value: Option<i64> = tokio::task::spawn_blocking(move || {
        let pool = mysql::Pool::new(url.as_str()).expect("connect through proxy");
        let mut conn = pool.get_conn().expect("get conn");
        let stmt = conn.prep("SELECT ? + ?").expect("prepare");
        conn.exec_first(&stmt, (40, 2)).expect("execute")
    })
    .await
    .expect("join");

    assert_eq!(value, Some(42));
}
