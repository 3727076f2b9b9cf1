// SPDX-License-Identifier: PMPL-1.0-or-later
//! Performance benchmarks for compiled query templates

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Runtime;

use verisim_compiled::expr::{field, member, QueryExpr, Queryable};
use verisim_compiled::{
    CompiledQuery, CompiledQueryConfig, CompiledQueryEngine, Document, InMemoryDocumentStore,
    InvocationCounters, ParamType, ParamValue, PlanCompiler, SqlTranslator, TemplateContext,
};

#[derive(Debug, Serialize, Deserialize)]
struct User {
    #[serde(rename = "FirstName")]
    first_name: String,
    #[serde(rename = "UserName")]
    user_name: String,
}

impl Document for User {
    fn collection() -> &'static str {
        "user"
    }
}

struct UserByUsername(String);

impl CompiledQuery for UserByUsername {
    type Document = User;
    type Output = Option<User>;

    fn query_is(&self, query: Queryable<User>, _ctx: &TemplateContext<'_>) -> QueryExpr<Option<User>> {
        query
            .filter(field("UserName").eq(member("UserName")))
            .first_or_default()
    }

    fn members(&self) -> &'static [(&'static str, ParamType)] {
        &[("UserName", ParamType::Text)]
    }

    fn read_member(&self, name: &str) -> Option<ParamValue> {
        (name == "UserName").then(|| ParamValue::from(&self.0))
    }
}

fn seeded_engine(users: usize) -> CompiledQueryEngine<InMemoryDocumentStore> {
    let store = InMemoryDocumentStore::new();
    for i in 0..users {
        store
            .store(&User {
                first_name: format!("First {}", i),
                user_name: format!("user-{}", i),
            })
            .unwrap();
    }
    CompiledQueryEngine::new(CompiledQueryConfig::default(), Arc::new(store)).unwrap()
}

// ============================================================================
// Compile vs. cached execution
// ============================================================================

fn bench_cold_compile(c: &mut Criterion) {
    let compiler = PlanCompiler::new(
        Arc::new(SqlTranslator::default()),
        Arc::new(InvocationCounters::new()),
        f64::MAX,
    );
    let template = UserByUsername("user-1".to_string());

    let mut group = c.benchmark_group("compiled");
    group.bench_function("cold_compile", |b| {
        b.iter(|| black_box(compiler.compile(&template).unwrap()))
    });
    group.finish();
}

fn bench_cached_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("compiled");

    for users in [100usize, 1000] {
        let engine = seeded_engine(users);
        engine.execute(&UserByUsername("user-0".to_string())).unwrap();

        group.throughput(Throughput::Elements(users as u64));
        group.bench_with_input(BenchmarkId::new("cached_execute", users), &users, |b, &n| {
            let template = UserByUsername(format!("user-{}", n / 2));
            b.iter(|| black_box(engine.execute(&template).unwrap()))
        });
    }

    group.finish();
}

fn bench_preview(c: &mut Criterion) {
    let engine = seeded_engine(10);
    let template = UserByUsername("user-3".to_string());
    engine.preview_command(&template).unwrap();

    let mut group = c.benchmark_group("compiled");
    group.bench_function("cached_preview", |b| {
        b.iter(|| black_box(engine.preview_command(&template).unwrap()))
    });
    group.finish();
}

fn bench_cached_execute_async(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = seeded_engine(1000);
    let template = UserByUsername("user-500".to_string());
    engine.execute(&template).unwrap();

    let mut group = c.benchmark_group("compiled");
    group.bench_function("cached_execute_async", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(engine.execute_async(&template).await.unwrap())
        });
    });
    group.finish();
}

criterion_group!(
    compile_benches,
    bench_cold_compile
);

criterion_group!(
    execute_benches,
    bench_cached_execute,
    bench_preview,
    bench_cached_execute_async
);

criterion_main!(
    compile_benches,
    execute_benches
);
