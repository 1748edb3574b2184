use criterion::{criterion_group, criterion_main, Criterion};
use reslock_core::{
    ImportParser, InferenceCache, InferenceEngine, ModuleMapper, PythonImportScanner, Requirement,
    RequirementRegistry, Unit,
};
use reslock_schema::config::{AmbiguityBehavior, UnownedDependencyBehavior};
use reslock_schema::default_mapping::DefaultModuleMapping;
use reslock_schema::fingerprint::requirements_fingerprint;
use reslock_schema::normalize::InferencePolicy;
use std::collections::BTreeSet;
use std::sync::Arc;

const DISTRIBUTIONS: &[&str] = &[
    "requests", "flask", "django", "numpy", "pandas", "PyYAML", "protobuf", "attrs",
    "beautifulsoup4", "python-dateutil", "types-requests", "pycryptodome", "setuptools",
    "Pillow", "scikit-learn", "opencv-python", "psycopg2-binary", "grpcio", "pytest",
];

fn registry(resolves: usize) -> RequirementRegistry {
    let mut reqs = Vec::new();
    for r in 0..resolves {
        let resolve = format!("r{r}");
        for name in DISTRIBUTIONS {
            reqs.push(Requirement::new(name, &[">=1"], &resolve).with_address(&format!("req:{name}-{r}")));
        }
    }
    RequirementRegistry::from_requirements(reqs).unwrap()
}

fn source() -> String {
    let mut s = String::from("\"\"\"Module docstring with import os inside.\"\"\"\n");
    for _ in 0..20 {
        s.push_str(
            "import os\nimport requests\nfrom yaml import safe_load\nfrom google.protobuf import message\n\
             try:\n    import ujson as json\nexcept ImportError:\n    import json\n\
             from sklearn.linear_model import (\n    LinearRegression,\n    Ridge,\n)\n\
             import cv2, PIL.Image\nfrom . import sibling\n",
        );
    }
    s
}

fn policy() -> InferencePolicy {
    InferencePolicy {
        unowned_dependency_behavior: UnownedDependencyBehavior::Warning,
        ambiguity_behavior: AmbiguityBehavior::Warning,
        ignored_modules: BTreeSet::new(),
    }
}

fn bench_scan(c: &mut Criterion) {
    let src = source();
    c.bench_function("scan_imports_280_lines", |b| {
        b.iter(|| PythonImportScanner.parse(&src));
    });
}

fn bench_infer(c: &mut Criterion) {
    let registry = registry(4);
    let mapper = Arc::new(ModuleMapper::new(
        &registry,
        Arc::new(DefaultModuleMapping::builtin()),
    ));
    let mut unit = Unit::new("src/app.py", "r2", &[]);
    unit.imports = PythonImportScanner.parse(&source());
    let engine = InferenceEngine::new(&registry, mapper, std::slice::from_ref(&unit), policy());

    c.bench_function("infer_unit_4_resolves", |b| {
        b.iter(|| engine.infer(&unit));
    });

    let cache = InferenceCache::new();
    cache.get_or_infer(&engine, &unit);
    c.bench_function("infer_unit_cached", |b| {
        b.iter(|| cache.get_or_infer(&engine, &unit));
    });
}

fn bench_mapper_construction(c: &mut Criterion) {
    let registry = registry(16);
    c.bench_function("module_mapper_16_resolves", |b| {
        b.iter(|| ModuleMapper::new(&registry, Arc::new(DefaultModuleMapping::builtin())));
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let reqs: Vec<String> = (0..500).map(|i| format!("package-{i}>=1.{i}")).collect();
    let ics = vec!["CPython>=3.8,<4".to_owned()];
    c.bench_function("requirements_fingerprint_500", |b| {
        b.iter(|| requirements_fingerprint(&reqs, &ics));
    });
}

criterion_group!(
    benches,
    bench_scan,
    bench_infer,
    bench_mapper_construction,
    bench_fingerprint
);
criterion_main!(benches);
