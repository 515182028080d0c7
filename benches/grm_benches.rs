use criterion::{black_box, criterion_group, criterion_main, Criterion};

use RustedGRM::autodiff::Active;
use RustedGRM::simulator::parameters::InMemoryParameterProvider;
use RustedGRM::GRM::GRM_model::GeneralRateModel;

fn make_model() -> GeneralRateModel {
    let mut p = InMemoryParameterProvider::new();
    p.set_int("NCOMP", 4);
    p.set_int("NCOL", 64);
    p.set_int("NPAR", 8);
    p.set_double_array("NBOUND", vec![1.0; 4]);
    p.set_double("COL_LENGTH", 1.0);
    p.set_double("COL_POROSITY", 0.4);
    p.set_double("PAR_RADIUS", 1e-3);
    p.set_double("PAR_POROSITY", 0.5);
    p.set_double_array("VELOCITY", vec![0.5]);
    p.set_double_array("COL_DISPERSION", vec![1e-3]);
    p.set_double_array("FILM_DIFFUSION", vec![1e-3; 4]);
    p.set_double_array("PAR_DIFFUSION", vec![1e-6; 4]);
    p.set_string("adsorption/ADSORPTION_MODEL", "MULTI_COMPONENT_LANGMUIR");
    p.set_bool("adsorption/IS_KINETIC", true);
    p.set_double_array("adsorption/MCL_KA", vec![1.0; 4]);
    p.set_double_array("adsorption/MCL_KD", vec![1.0; 4]);
    p.set_double_array("adsorption/MCL_QMAX", vec![5.0; 4]);
    p.set_double_array("inlet/sec_000/CONST_COEFF", vec![1.0; 4]);
    GeneralRateModel::configure(&mut p, 1).unwrap()
}

fn bench_residual(c: &mut Criterion) {
    let mut model = make_model();
    model.set_section(0, Active::constant(0.0), 10.0);
    let n = model.num_dofs();
    let y: Vec<f64> = (0..n).map(|i| 0.3 + 0.05 * ((i % 7) as f64)).collect();
    let ydot = vec![0.0; n];
    let mut res = vec![0.0; n];
    c.bench_function("grm residual 4x64x8", |b| {
        b.iter(|| {
            model.residual(1.0, 0, 10.0, black_box(&y), Some(&ydot), &mut res, false);
        })
    });
}

fn bench_linear_solve(c: &mut Criterion) {
    let mut model = make_model();
    model.set_section(0, Active::constant(0.0), 10.0);
    let n = model.num_dofs();
    let y: Vec<f64> = (0..n).map(|i| 0.3 + 0.05 * ((i % 7) as f64)).collect();
    let mut res = vec![0.0; n];
    model.residual(1.0, 0, 10.0, &y, None, &mut res, true);
    model.schur_safety = 1.0;
    let weight = vec![1.0; n];
    c.bench_function("grm schur linear solve 4x64x8", |b| {
        b.iter(|| {
            let mut rhs: Vec<f64> = (0..n).map(|i| ((i % 13) as f64 - 6.0) / 6.0).collect();
            model.invalidate_factorization();
            let status = model.linear_solve(0.0, 2.0, 1e-9, &mut rhs, &weight);
            black_box(status);
        })
    });
}

criterion_group!(benches, bench_residual, bench_linear_solve);
criterion_main!(benches);
