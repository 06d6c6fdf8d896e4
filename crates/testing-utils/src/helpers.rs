//! 测试辅助函数：构造题目文档和表格，等待异步条件

use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;

pub struct TestEnv;

impl TestEnv {
    /// 轮询等待条件成立，超时返回false
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

pub struct TestData;

impl TestData {
    /// 生成HTML表格，第一行为表头
    pub fn table(headers: &[&str], rows: &[&[&str]]) -> String {
        let mut html = String::from("<table><tr>");
        for header in headers {
            html.push_str(&format!("<th>{header}</th>"));
        }
        html.push_str("</tr>");
        for row in rows {
            html.push_str("<tr>");
            for cell in row.iter() {
                html.push_str(&format!("<td>{cell}</td>"));
            }
            html.push_str("</tr>");
        }
        html.push_str("</table>");
        html
    }

    /// 表头3列但数据行只有2列的表格，审计结果为COL_MISMATCH
    pub fn mismatched_table(tag: &str) -> String {
        Self::table(&["Ano", "Produção", "Variação"], &[&[tag, "10"]])
    }

    pub fn clean_table(tag: &str) -> String {
        Self::table(&["Ano", "Produção", "Variação"], &[&[tag, "10", "2%"]])
    }

    /// 由题目文本组成的上传文档（裸数组格式）
    pub fn document(statements: &[String]) -> String {
        let questions: Vec<Value> = statements
            .iter()
            .enumerate()
            .map(|(i, text)| {
                json!({
                    "id": format!("Q{}", i + 1),
                    "disciplina": "Matemática",
                    "enunciado": text,
                })
            })
            .collect();
        Value::Array(questions).to_string()
    }
}
