//! The compartmental simulator: deterministic forward-Euler integration of
//! the stratified HIV natural-history model over the simulation grid.
//!
//! The state per population is one susceptible compartment plus five care
//! cascades (undiagnosed, diagnosed, first-line treatment, treatment
//! failure, second-line treatment), each stratified over six CD4 stages.

use ndarray::{Array1, Array2, Array3};

use hivalloc_core::{eligible_from_stage, Error, Locus, PopulationSet, Result, NCD4};

use crate::modelpars::{ActType, ModelPars};

/// Number of health states per population.
pub const NSTATES: usize = 1 + 5 * NCD4;

/// Susceptible compartment index.
pub const SUS: usize = 0;

#[inline]
pub fn undx(cd4: usize) -> usize {
    1 + cd4
}

#[inline]
pub fn dx(cd4: usize) -> usize {
    1 + NCD4 + cd4
}

#[inline]
pub fn tx1(cd4: usize) -> usize {
    1 + 2 * NCD4 + cd4
}

#[inline]
pub fn fail(cd4: usize) -> usize {
    1 + 3 * NCD4 + cd4
}

#[inline]
pub fn tx2(cd4: usize) -> usize {
    1 + 4 * NCD4 + cd4
}

/// Small number guarding divisions.
const EPS: f64 = 1e-3;

/// Relative tolerance for the zero floor; a larger negative excursion is a
/// hard `Numerical` failure rather than a silent clamp.
const NEGATIVE_TOLERANCE: f64 = 1e-6;

/// Rate-balance assumptions used only for the initial state.
const PREV_TO_FORCEINF: f64 = 0.1;
const EFF_TREATMENT_RATE: f64 = 0.1;
const FAIL_RATIO: f64 = 0.3;

/// Trajectories produced by a simulation. All flow series are annualized
/// (per year, not per step); multiply by `dt` and sum to accumulate.
#[derive(Clone, Debug, PartialEq)]
pub struct SimOutput {
    pub tvec: Vec<f64>,
    pub dt: f64,
    /// Full state: (nstates x npops x npts).
    pub people: Array3<f64>,
    /// New infections per year by population.
    pub inci: Array2<f64>,
    pub sexinci: Array2<f64>,
    pub injinci: Array2<f64>,
    /// Diagnoses per year.
    pub dxrate: Array2<f64>,
    /// Treatment initiations per year.
    pub newtx1: Array2<f64>,
    pub newtx2: Array2<f64>,
    /// HIV-attributable deaths per year.
    pub death: Array2<f64>,
    /// Prevalence by population and overall.
    pub prev: Array2<f64>,
    pub allprev: Array1<f64>,
    /// Births and mother-to-child transmissions per year.
    pub births: Array1<f64>,
    pub mtct: Array1<f64>,
    /// Circumcised men, new circumcisions per year, and unmet need.
    pub numcircum: Array2<f64>,
    pub newcircum: Array2<f64>,
    pub reqcircum: Array1<f64>,
}

/// The simulator. Owns its working copy of the parameters because
/// number-driven circumcision feeds back into the prevalence series.
pub struct Simulator {
    pars: ModelPars,
    male: Vec<bool>,
    injects: Vec<bool>,
    pop_names: Vec<String>,
}

impl Simulator {
    pub fn new(pars: ModelPars, popset: &PopulationSet) -> Result<Self> {
        let npops = popset.len();
        if pars.popsize.shape()[0] != npops {
            return Err(Error::ShapeMismatch {
                expected: format!("{} populations", npops),
                actual: format!("{}", pars.popsize.shape()[0]),
                locus: Locus::parameter("popsize"),
            });
        }
        if pars.hivprev.len() != npops {
            return Err(Error::ShapeMismatch {
                expected: format!("{} populations", npops),
                actual: format!("{}", pars.hivprev.len()),
                locus: Locus::parameter("hivprev"),
            });
        }
        Ok(Simulator {
            pars,
            male: popset.male_flags(),
            injects: popset.injector_flags(),
            pop_names: popset.iter().map(|p| p.short.clone()).collect(),
        })
    }

    /// Rate-balance equilibration of the initial state.
    fn equilibrate(&self) -> Result<Array2<f64>> {
        let pars = &self.pars;
        let npops = pars.npops();
        let consts = &pars.consts;
        let mut init = Array2::zeros((NSTATES, npops));

        let allinfected: Vec<f64> = (0..npops)
            .map(|p| pars.popsize[[p, 0]] * pars.hivprev[p])
            .collect();
        let totalinfected: f64 = allinfected.iter().sum();

        // Distribution weights across CD4 stages: inverse progression rates
        // for untreated cascades, inverse recovery rates for treated ones.
        let death_stage = consts.death.stage.as_array();
        let mut progratios = [0.0; NCD4];
        for cd4 in 0..NCD4 - 1 {
            progratios[cd4] = 1.0 / consts.prog[cd4];
        }
        progratios[NCD4 - 1] = 1.0 / death_stage[NCD4 - 1];
        let progsum: f64 = progratios.iter().sum();
        for r in progratios.iter_mut() {
            *r /= progsum;
        }
        let mut recovratios = [0.0; NCD4];
        for cd4 in 1..NCD4 - 1 {
            recovratios[cd4] = 1.0 / consts.recov[cd4 - 1];
        }
        recovratios[NCD4 - 1] = 1.0 / EFF_TREATMENT_RATE;
        let recovsum: f64 = recovratios.iter().sum();
        for r in recovratios.iter_mut() {
            *r /= recovsum;
        }

        for p in 0..npops {
            let n0 = pars.popsize[[p, 0]];
            let uninfected = n0 * (1.0 - pars.hivprev[p]);
            let popinfected = allinfected[p];
            let fractotal = if totalinfected > 0.0 {
                popinfected / totalinfected
            } else {
                0.0
            };

            let mut treatment1 = pars.tx1[0] * fractotal;
            let mut treatment2 = pars.tx2[0] * fractotal;
            let mut treatfail =
                treatment1 * consts.failfirst * EFF_TREATMENT_RATE * FAIL_RATIO;
            let mut totaltreat = treatment1 + treatment2 + treatfail;
            if totaltreat > popinfected && totaltreat > 0.0 {
                let scale = popinfected / totaltreat;
                treatment1 *= scale;
                treatment2 *= scale;
                treatfail *= scale;
                totaltreat = popinfected;
            }

            let nevertreated = popinfected - totaltreat;
            let assumedforceinf = pars.hivprev[p] * PREV_TO_FORCEINF;
            let undxdxrates = assumedforceinf + pars.hivtest[[p, 0]] + EPS;
            let undiagnosed = nevertreated * (assumedforceinf + EPS) / undxdxrates;
            let diagnosed = nevertreated * pars.hivtest[[p, 0]] / undxdxrates;

            init[[SUS, p]] = uninfected;
            for cd4 in 0..NCD4 {
                init[[undx(cd4), p]] = undiagnosed * progratios[cd4];
                init[[dx(cd4), p]] = diagnosed * progratios[cd4];
                init[[tx1(cd4), p]] = treatment1 * recovratios[cd4];
                init[[fail(cd4), p]] = treatfail * progratios[cd4];
                init[[tx2(cd4), p]] = treatment2 * recovratios[cd4];
            }
        }

        for v in init.iter() {
            if *v < 0.0 || !v.is_finite() {
                return Err(Error::Numerical {
                    reason: "negative or non-finite initial state".into(),
                    locus: Locus::default().with_year(self.pars.tvec[0]),
                });
            }
        }
        Ok(init)
    }

    /// Run the simulation from the equilibrated initial state.
    pub fn run(mut self) -> Result<SimOutput> {
        let init = self.equilibrate()?;
        self.run_from(init)
    }

    /// Run the simulation from a supplied initial state.
    pub fn run_from(&mut self, init: Array2<f64>) -> Result<SimOutput> {
        let npops = self.pars.npops();
        let npts = self.pars.npts();
        let dt = self.pars.dt;
        let consts = self.pars.consts;
        let tvec = self.pars.tvec.clone();

        if init.shape() != [NSTATES, npops] {
            return Err(Error::ShapeMismatch {
                expected: format!("{}x{} initial state", NSTATES, npops),
                actual: format!("{:?}", init.shape()),
                locus: Locus::default(),
            });
        }

        let mut people = Array3::zeros((NSTATES, npops, npts));
        for s in 0..NSTATES {
            for p in 0..npops {
                people[[s, p, 0]] = init[[s, p]];
            }
        }

        let mut out = SimOutput {
            tvec: tvec.clone(),
            dt,
            people: Array3::zeros((0, 0, 0)),
            inci: Array2::zeros((npops, npts)),
            sexinci: Array2::zeros((npops, npts)),
            injinci: Array2::zeros((npops, npts)),
            dxrate: Array2::zeros((npops, npts)),
            newtx1: Array2::zeros((npops, npts)),
            newtx2: Array2::zeros((npops, npts)),
            death: Array2::zeros((npops, npts)),
            prev: Array2::zeros((npops, npts)),
            allprev: Array1::zeros(npts),
            births: Array1::zeros(npts),
            mtct: Array1::zeros(npts),
            numcircum: Array2::zeros((npops, npts)),
            newcircum: Array2::zeros((npops, npts)),
            reqcircum: Array1::zeros(npts),
        };

        let cd4trans = consts.cd4trans.as_array();
        let death_stage = consts.death.stage.as_array();
        let dx_weight = 1.0 - consts.eff.dx;
        let tx_weight = (1.0 - consts.eff.tx) * dx_weight;
        let male = self.male.clone();

        for t in 0..npts {
            // Population totals and infectiousness-weighted prevalence.
            let mut allpeople = vec![0.0; npops];
            let mut effhivprev = vec![0.0; npops];
            for p in 0..npops {
                let mut total = 0.0;
                for s in 0..NSTATES {
                    total += people[[s, p, t]];
                }
                if total <= 0.0 {
                    return Err(Error::Numerical {
                        reason: "population emptied".into(),
                        locus: Locus::population(self.pop_names[p].clone())
                            .with_year(tvec[t]),
                    });
                }
                allpeople[p] = total;
                let mut eff = 0.0;
                for cd4 in 0..NCD4 {
                    eff += cd4trans[cd4] * people[[undx(cd4), p, t]];
                    eff += dx_weight
                        * cd4trans[cd4]
                        * (people[[dx(cd4), p, t]] + people[[fail(cd4), p, t]]);
                    eff += tx_weight
                        * cd4trans[cd4]
                        * (people[[tx1(cd4), p, t]] + people[[tx2(cd4), p, t]]);
                }
                effhivprev[p] = eff / total;
                if effhivprev[p] < 0.0 {
                    return Err(Error::Numerical {
                        reason: format!("invalid effective prevalence {:.3e}", effhivprev[p]),
                        locus: Locus::population(self.pop_names[p].clone())
                            .with_year(tvec[t]),
                    });
                }
            }

            // Prevalence outputs.
            let mut plhiv_total = 0.0;
            let mut all_total = 0.0;
            for p in 0..npops {
                let plhiv = allpeople[p] - people[[SUS, p, t]];
                out.prev[[p, t]] = plhiv / allpeople[p];
                plhiv_total += plhiv;
                all_total += allpeople[p];
            }
            out.allprev[t] = plhiv_total / all_total;

            // Force of infection, sexual and injecting tracked separately.
            let mut foi_sex = vec![0.0; npops];
            let mut foi_inj = vec![0.0; npops];

            for pop_m in 0..npops {
                let circeff_m = 1.0 - consts.eff.circ * self.pars.circum[[pop_m, t]];
                for pop_f in 0..npops {
                    let trans_m = if male[pop_f] {
                        consts.trans.mmi
                    } else {
                        consts.trans.mfi
                    };
                    let trans_f = if male[pop_f] {
                        consts.trans.mmr
                    } else {
                        consts.trans.mfr
                    };
                    let prophylaxis = |p: usize| {
                        (1.0 - consts.eff.prep * self.pars.prep[[p, t]])
                            * (1.0 - consts.eff.pep * self.pars.pep[[p, t]])
                    };
                    let prepeff_m = prophylaxis(pop_m);
                    let prepeff_f = prophylaxis(pop_f);
                    let stieff_m = 1.0 + consts.eff.sti * self.pars.stiprevulc[[pop_m, t]];
                    let stieff_f = 1.0 + consts.eff.sti * self.pars.stiprevulc[[pop_f, t]];

                    for act in ActType::SEXUAL {
                        if self.pars.pships.get(act)[[pop_m, pop_f]] <= 0.0 {
                            continue;
                        }
                        let acts = self.pars.totalacts.get(act);
                        let numacts_m = acts[[pop_m, pop_f, t]];
                        let numacts_f = acts[[pop_f, pop_m, t]];
                        let condom = self.pars.condom.get(act);
                        let condomprob =
                            (condom[[pop_m, t]] + condom[[pop_f, t]]) / 2.0;
                        let condomeff = 1.0 - condomprob * consts.eff.condom;
                        let per_act_m =
                            (trans_m * circeff_m * prepeff_m * stieff_m).clamp(0.0, 1.0);
                        let per_act_f = (trans_f * prepeff_f * stieff_f).clamp(0.0, 1.0);
                        let force_m = 1.0
                            - (1.0 - per_act_m)
                                .powf(dt * numacts_m * condomeff * effhivprev[pop_f]);
                        let force_f = 1.0
                            - (1.0 - per_act_f)
                                .powf(dt * numacts_f * condomeff * effhivprev[pop_m]);
                        foi_sex[pop_m] = 1.0 - (1.0 - foi_sex[pop_m]) * (1.0 - force_m);
                        foi_sex[pop_f] = 1.0 - (1.0 - foi_sex[pop_f]) * (1.0 - force_f);
                    }
                }
            }

            // Injecting route, modulated by OST and equipment sharing.
            let osteff = {
                let numost = self.pars.numost[t];
                let cov = if numost <= 1.0 {
                    numost
                } else {
                    let numpwid: f64 = (0..npops)
                        .filter(|&p| self.injects[p])
                        .map(|p| self.pars.popsize[[p, t]])
                        .sum();
                    (numost / (numpwid + EPS)).min(1.0)
                };
                1.0 - cov * consts.eff.ost
            };
            if osteff < 0.0 {
                return Err(Error::Numerical {
                    reason: format!("invalid OST effect {:.3}", osteff),
                    locus: Locus::parameter("numost").with_year(tvec[t]),
                });
            }
            for p1 in 0..npops {
                for p2 in 0..npops {
                    if self.pars.pships.inj[[p1, p2]] <= 0.0 {
                        continue;
                    }
                    let sharing = self.pars.sharing[t];
                    let acts1 = sharing * self.pars.totalacts.inj[[p1, p2, t]] / 2.0;
                    let acts2 = sharing * self.pars.totalacts.inj[[p2, p1, t]] / 2.0;
                    let force1 = 1.0
                        - (1.0 - consts.trans.inj)
                            .powf(dt * acts1 * osteff * effhivprev[p2]);
                    let force2 = 1.0
                        - (1.0 - consts.trans.inj)
                            .powf(dt * acts2 * osteff * effhivprev[p1]);
                    foi_inj[p1] = 1.0 - (1.0 - foi_inj[p1]) * (1.0 - force1);
                    foi_inj[p2] = 1.0 - (1.0 - foi_inj[p2]) * (1.0 - force2);
                }
            }

            // Births and mother-to-child transmission.
            let effmtct = consts.trans.mtctbreast * self.pars.breast[t]
                + consts.trans.mtctnobreast * (1.0 - self.pars.breast[t]);
            let pmtcteff = (1.0 - consts.eff.pmtct) * effmtct;
            let mut births = 0.0;
            let mut births_tx = 0.0;
            let mut births_untx = 0.0;
            let mut births_elig = 0.0;
            for p in 0..npops {
                let rate = self.pars.birth[[p, t]];
                births += rate * allpeople[p];
                let mut on_tx = 0.0;
                let mut undiag = 0.0;
                let mut diag = 0.0;
                for cd4 in 0..NCD4 {
                    on_tx += people[[tx1(cd4), p, t]] + people[[tx2(cd4), p, t]];
                    undiag += people[[undx(cd4), p, t]] + people[[fail(cd4), p, t]];
                    diag += people[[dx(cd4), p, t]];
                }
                births_tx += rate * on_tx;
                births_untx += rate * undiag;
                births_elig += rate * diag;
            }
            let receive_pmtct = if self.pars.numpmtct[t] > 1.0 {
                self.pars.numpmtct[t].min(births_elig)
            } else {
                self.pars.numpmtct[t] * births_elig
            };
            out.births[t] = births;
            out.mtct[t] = births_untx * effmtct
                + (births_elig - receive_pmtct) * effmtct
                + births_tx * pmtcteff
                + receive_pmtct * pmtcteff;

            // Demographic transitions move people (and circumcised men)
            // between populations before the disease flows.
            let mut numcirc: Vec<f64> = (0..npops)
                .map(|p| {
                    if male[p] {
                        people[[SUS, p, t]] * self.pars.circum[[p, t]]
                    } else {
                        0.0
                    }
                })
                .collect();

            for p1 in 0..npops {
                for p2 in 0..npops {
                    let rate = self.pars.transit_asym[[p1, p2]];
                    if rate <= 0.0 {
                        continue;
                    }
                    if male[p1] != male[p2] {
                        return Err(Error::Infeasible {
                            reason: "aging transition crosses sexes".into(),
                            locus: Locus::population(self.pop_names[p1].clone())
                                .with_year(tvec[t]),
                        });
                    }
                    if male[p1] {
                        let circs = numcirc[p1] * rate * dt;
                        numcirc[p1] -= circs;
                        numcirc[p2] += circs;
                    }
                    for s in 0..NSTATES {
                        let moving = people[[s, p1, t]] * rate * dt;
                        people[[s, p1, t]] -= moving;
                        people[[s, p2, t]] += moving;
                    }
                }
            }
            for p1 in 0..npops {
                for p2 in 0..npops {
                    let rate = self.pars.transit_sym[[p1, p2]];
                    if rate <= 0.0 || p1 >= p2 {
                        continue;
                    }
                    let sum1: f64 = (0..NSTATES).map(|s| people[[s, p1, t]]).sum();
                    let sum2: f64 = (0..NSTATES).map(|s| people[[s, p2, t]]).sum();
                    if male[p1] && male[p2] {
                        let circs1 = numcirc[p1] * rate * dt;
                        let circs2 =
                            numcirc[p2] * rate * dt * (numcirc[p1] / (numcirc[p2] + EPS));
                        numcirc[p1] += -circs1 + circs2;
                        numcirc[p2] += circs1 - circs2;
                    }
                    for s in 0..NSTATES {
                        let moving1 = people[[s, p1, t]] * rate * dt;
                        let moving2 =
                            people[[s, p2, t]] * rate * dt * (sum1 / (sum2 + EPS));
                        people[[s, p1, t]] += -moving1 + moving2;
                        people[[s, p2, t]] += moving1 - moving2;
                    }
                }
            }

            // Number-driven circumcision: perform new circumcisions capped
            // by the unmet need and carry the prevalence forward.
            let mut reqtotal = 0.0;
            for p in 0..npops {
                if !male[p] {
                    continue;
                }
                let susc_males = people[[SUS, p, t]];
                let req = (susc_males - numcirc[p]).max(0.0);
                let newcircs = (self.pars.numcircum[[p, t]] * dt).min(req);
                out.numcircum[[p, t]] = numcirc[p] + newcircs;
                out.newcircum[[p, t]] = newcircs / dt;
                reqtotal += (req - newcircs).max(0.0);
                if newcircs > 0.0 && t + 1 < npts && susc_males > 0.0 {
                    let propcirc =
                        ((numcirc[p] + newcircs) / susc_males).clamp(0.0, 1.0);
                    for j in t + 1..npts {
                        self.pars.circum[[p, j]] = propcirc;
                    }
                }
            }
            out.reqcircum[t] = reqtotal;

            // Disease flows.
            let mut change = Array2::<f64>::zeros((NSTATES, npops));
            let elig_start = eligible_from_stage(self.pars.txelig[t]);

            for p in 0..npops {
                let foi = 1.0 - (1.0 - foi_sex[p]) * (1.0 - foi_inj[p]);
                let newinf = foi * people[[SUS, p, t]];
                let wsex = if foi_sex[p] + foi_inj[p] > 0.0 {
                    foi_sex[p] / (foi_sex[p] + foi_inj[p])
                } else {
                    0.0
                };
                out.inci[[p, t]] = newinf / dt;
                out.sexinci[[p, t]] = newinf * wsex / dt;
                out.injinci[[p, t]] = newinf * (1.0 - wsex) / dt;
                change[[SUS, p]] = -newinf;
                change[[undx(0), p]] += newinf;
            }

            let background: Vec<f64> = (0..npops).map(|p| self.pars.death[[p, t]]).collect();
            let efftb: Vec<f64> = (0..npops)
                .map(|p| consts.death.tb * self.pars.tbprev[[p, t]])
                .collect();

            // Undiagnosed: progression, testing, mortality.
            let mut newdiag = vec![vec![0.0; npops]; NCD4];
            let use_propaware = (0..npops).any(|p| self.pars.propaware[[p, t]] > 0.0);
            let mut prop_pull = vec![0.0; npops];
            if use_propaware {
                for p in 0..npops {
                    let mut plhiv = 0.0;
                    let mut diagnosed = 0.0;
                    for cd4 in 0..NCD4 {
                        plhiv += people[[undx(cd4), p, t]]
                            + people[[dx(cd4), p, t]]
                            + people[[tx1(cd4), p, t]]
                            + people[[fail(cd4), p, t]]
                            + people[[tx2(cd4), p, t]];
                        diagnosed += people[[dx(cd4), p, t]]
                            + people[[tx1(cd4), p, t]]
                            + people[[fail(cd4), p, t]]
                            + people[[tx2(cd4), p, t]];
                    }
                    let undiagnosed = plhiv - diagnosed;
                    prop_pull[p] = ((self.pars.propaware[[p, t]] * plhiv - diagnosed)
                        / (undiagnosed + EPS))
                        .clamp(0.0, 1.0);
                }
            }
            for cd4 in 0..NCD4 {
                for p in 0..npops {
                    let here = people[[undx(cd4), p, t]];
                    let progin = if cd4 > 0 {
                        dt * consts.prog[cd4 - 1] * people[[undx(cd4 - 1), p, t]]
                    } else {
                        0.0
                    };
                    let progout = if cd4 < NCD4 - 1 {
                        dt * consts.prog[cd4] * here
                    } else {
                        0.0
                    };
                    let testing = if cd4 < NCD4 - 1 {
                        self.pars.hivtest[[p, t]]
                    } else {
                        self.pars.hivtest[[p, t]].max(self.pars.aidstest[t])
                    };
                    newdiag[cd4][p] = if use_propaware {
                        prop_pull[p] * here
                    } else {
                        dt * here * testing
                    };
                    let hivtbdeath = ((1.0 + efftb[p]) * death_stage[cd4]).min(1.0);
                    let hivdeaths = dt * here * hivtbdeath;
                    let otherdeaths = dt * here * background[p];
                    let mut delta =
                        progin - progout - newdiag[cd4][p] - hivdeaths - otherdeaths;
                    if delta + here < 0.0 {
                        delta = -here;
                    }
                    change[[undx(cd4), p]] += delta;
                    out.dxrate[[p, t]] += newdiag[cd4][p] / dt;
                    out.death[[p, t]] += hivdeaths / dt;
                }
            }

            // Treatment initiation targets.
            let current_tx1: f64 = (0..NCD4)
                .flat_map(|cd4| (0..npops).map(move |p| (cd4, p)))
                .map(|(cd4, p)| people[[tx1(cd4), p, t]])
                .sum();
            let current_tx2: f64 = (0..NCD4)
                .flat_map(|cd4| (0..npops).map(move |p| (cd4, p)))
                .map(|(cd4, p)| people[[tx2(cd4), p, t]])
                .sum();
            let newtreat1_total = if self.pars.txtotal[t] > 0.0 {
                let mut plhiv = 0.0;
                let mut on_tx = 0.0;
                for cd4 in 0..NCD4 {
                    for p in 0..npops {
                        plhiv += people[[undx(cd4), p, t]]
                            + people[[dx(cd4), p, t]]
                            + people[[tx1(cd4), p, t]]
                            + people[[fail(cd4), p, t]]
                            + people[[tx2(cd4), p, t]];
                        on_tx += people[[tx1(cd4), p, t]]
                            + people[[fail(cd4), p, t]]
                            + people[[tx2(cd4), p, t]];
                    }
                }
                let target = if self.pars.txtotal[t] <= 1.0 {
                    self.pars.txtotal[t] * plhiv
                } else {
                    self.pars.txtotal[t]
                };
                (target - on_tx).max(0.0)
            } else {
                (self.pars.tx1[t] - current_tx1).max(0.0)
            };

            // Diagnosed: progression, mortality, and initiation onto
            // first-line treatment filling the sickest stages first.
            let mut avail_dx = vec![vec![0.0; npops]; NCD4];
            let mut dx_flows = vec![vec![(0.0, 0.0, 0.0, 0.0); npops]; NCD4];
            for cd4 in 0..NCD4 {
                for p in 0..npops {
                    let here = people[[dx(cd4), p, t]];
                    let progin = if cd4 > 0 {
                        dt * consts.prog[cd4 - 1] * people[[dx(cd4 - 1), p, t]]
                    } else {
                        0.0
                    };
                    let progout = if cd4 < NCD4 - 1 {
                        dt * consts.prog[cd4] * here
                    } else {
                        0.0
                    };
                    let hivtbdeath = ((1.0 + efftb[p]) * death_stage[cd4]).min(1.0);
                    let hivdeaths = dt * here * hivtbdeath;
                    let otherdeaths = dt * here * background[p];
                    dx_flows[cd4][p] = (progin, progout, hivdeaths, otherdeaths);
                    let inflow = progin + newdiag[cd4][p];
                    let outflow = progout + hivdeaths + otherdeaths;
                    avail_dx[cd4][p] = (here + inflow - outflow).max(0.0);
                }
            }
            let newtreat1 =
                allocate_treatment(newtreat1_total, &avail_dx, elig_start, npops);
            for cd4 in 0..NCD4 {
                for p in 0..npops {
                    let here = people[[dx(cd4), p, t]];
                    let (progin, progout, hivdeaths, otherdeaths) = dx_flows[cd4][p];
                    let mut delta = progin + newdiag[cd4][p]
                        - progout
                        - hivdeaths
                        - otherdeaths
                        - newtreat1[cd4][p];
                    if delta + here < 0.0 {
                        delta = -here;
                    }
                    change[[dx(cd4), p]] += delta;
                    out.newtx1[[p, t]] += newtreat1[cd4][p] / dt;
                    out.death[[p, t]] += hivdeaths / dt;
                }
            }

            // First-line treatment: recovery up the CD4 ladder, failure,
            // capped on-treatment mortality.
            let mut newfail1 = vec![vec![0.0; npops]; NCD4];
            for cd4 in 0..NCD4 {
                for p in 0..npops {
                    let here = people[[tx1(cd4), p, t]];
                    let recovin = if cd4 > 0 && cd4 < NCD4 - 1 {
                        dt * consts.recov[cd4 - 1] * people[[tx1(cd4 + 1), p, t]]
                    } else {
                        0.0
                    };
                    let recovout = if cd4 > 1 {
                        dt * consts.recov[cd4 - 2] * here
                    } else {
                        0.0
                    };
                    newfail1[cd4][p] = dt * here * consts.failfirst;
                    let hivtbdeath = ((1.0 + efftb[p]) * death_stage[cd4]).min(1.0);
                    let txdeath = ((1.0 + efftb[p]) * consts.death.treat).min(1.0);
                    let hivdeaths = dt * here * hivtbdeath.min(txdeath);
                    let otherdeaths = dt * here * background[p];
                    let mut delta = recovin - recovout + newtreat1[cd4][p]
                        - newfail1[cd4][p]
                        - hivdeaths
                        - otherdeaths;
                    if delta + here < 0.0 {
                        delta = -here;
                    }
                    change[[tx1(cd4), p]] += delta;
                    out.death[[p, t]] += hivdeaths / dt;
                }
            }

            // Treatment failure: progression plus inflow from both lines,
            // initiation onto second-line treatment, sickest first.
            let newtreat2_total = (self.pars.tx2[t] - current_tx2).max(0.0);
            let mut newfail2 = vec![vec![0.0; npops]; NCD4];
            let mut avail_fail = vec![vec![0.0; npops]; NCD4];
            let mut fail_flows = vec![vec![(0.0, 0.0, 0.0, 0.0); npops]; NCD4];
            for cd4 in 0..NCD4 {
                for p in 0..npops {
                    let here = people[[fail(cd4), p, t]];
                    let progin = if cd4 > 0 {
                        dt * consts.prog[cd4 - 1] * people[[fail(cd4 - 1), p, t]]
                    } else {
                        0.0
                    };
                    let progout = if cd4 < NCD4 - 1 {
                        dt * consts.prog[cd4] * here
                    } else {
                        0.0
                    };
                    newfail2[cd4][p] = dt * people[[tx2(cd4), p, t]] * consts.failsecond;
                    let hivtbdeath = ((1.0 + efftb[p]) * death_stage[cd4]).min(1.0);
                    let hivdeaths = dt * here * hivtbdeath;
                    let otherdeaths = dt * here * background[p];
                    fail_flows[cd4][p] = (progin, progout, hivdeaths, otherdeaths);
                    let inflow = progin + newfail1[cd4][p] + newfail2[cd4][p];
                    let outflow = progout + hivdeaths + otherdeaths;
                    avail_fail[cd4][p] = (here + inflow - outflow).max(0.0);
                }
            }
            let newtreat2 = allocate_treatment(newtreat2_total, &avail_fail, 0, npops);
            for cd4 in 0..NCD4 {
                for p in 0..npops {
                    let here = people[[fail(cd4), p, t]];
                    let (progin, progout, hivdeaths, otherdeaths) = fail_flows[cd4][p];
                    let mut delta = progin + newfail1[cd4][p] + newfail2[cd4][p]
                        - progout
                        - hivdeaths
                        - otherdeaths
                        - newtreat2[cd4][p];
                    if delta + here < 0.0 {
                        delta = -here;
                    }
                    change[[fail(cd4), p]] += delta;
                    out.newtx2[[p, t]] += newtreat2[cd4][p] / dt;
                    out.death[[p, t]] += hivdeaths / dt;
                }
            }

            // Second-line treatment.
            for cd4 in 0..NCD4 {
                for p in 0..npops {
                    let here = people[[tx2(cd4), p, t]];
                    let recovin = if cd4 > 0 && cd4 < NCD4 - 1 {
                        dt * consts.recov[cd4 - 1] * people[[tx2(cd4 + 1), p, t]]
                    } else {
                        0.0
                    };
                    let recovout = if cd4 > 1 {
                        dt * consts.recov[cd4 - 2] * here
                    } else {
                        0.0
                    };
                    let hivtbdeath = ((1.0 + efftb[p]) * death_stage[cd4]).min(1.0);
                    let txdeath = ((1.0 + efftb[p]) * consts.death.treat).min(1.0);
                    let hivdeaths = dt * here * hivtbdeath.min(txdeath);
                    let otherdeaths = dt * here * background[p];
                    let mut delta = recovin - recovout + newtreat2[cd4][p]
                        - newfail2[cd4][p]
                        - hivdeaths
                        - otherdeaths;
                    if delta + here < 0.0 {
                        delta = -here;
                    }
                    change[[tx2(cd4), p]] += delta;
                    out.death[[p, t]] += hivdeaths / dt;
                }
            }

            // Advance, reconciling against the target population sizes.
            if t + 1 < npts {
                for p in 0..npops {
                    for s in 0..NSTATES {
                        people[[s, p, t + 1]] = people[[s, p, t]] + change[[s, p]];
                    }
                    let current: f64 = (0..NSTATES).map(|s| people[[s, p, t + 1]]).sum();
                    let target = self.pars.popsize[[p, t + 1]];
                    let gap = target - current;
                    if gap >= 0.0 {
                        people[[SUS, p, t + 1]] += gap;
                    } else if current > 0.0 {
                        let scale = target / current;
                        for s in 0..NSTATES {
                            people[[s, p, t + 1]] *= scale;
                        }
                    }
                    let tolerance = NEGATIVE_TOLERANCE * target.max(1.0);
                    for s in 0..NSTATES {
                        let v = people[[s, p, t + 1]];
                        if v < -tolerance {
                            return Err(Error::Numerical {
                                reason: format!(
                                    "negative compartment {:.3e} beyond tolerance",
                                    v
                                ),
                                locus: Locus::population(self.pop_names[p].clone())
                                    .with_year(tvec[t + 1]),
                            });
                        }
                        if v < 0.0 {
                            people[[s, p, t + 1]] = 0.0;
                        }
                    }
                }
            }
        }

        out.people = people;
        Ok(out)
    }
}

/// Distribute `total` new treatment initiations over the availability grid,
/// filling later (sicker) stages first and proportionally across
/// populations within a stage. Stages before `elig_start` are ineligible.
fn allocate_treatment(
    total: f64,
    avail: &[Vec<f64>],
    elig_start: usize,
    npops: usize,
) -> Vec<Vec<f64>> {
    let ncd4 = avail.len();
    let mut out = vec![vec![0.0; npops]; ncd4];
    let mut remaining = total.max(0.0);
    for cd4 in (elig_start..ncd4).rev() {
        if remaining <= 0.0 {
            break;
        }
        let stage_total: f64 = avail[cd4].iter().sum();
        if stage_total <= 0.0 {
            continue;
        }
        let take = remaining.min(stage_total);
        for p in 0..npops {
            out[cd4][p] = take * avail[cd4][p] / stage_total;
        }
        remaining -= take;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivalloc_core::{
        Anchors, InputKey, Par, ParameterSet, Population, PopulationSet, TimeGrid,
    };

    fn popset() -> PopulationSet {
        PopulationSet::new(vec![
            Population::new("M", "Males 15-49").male(),
            Population::new("F", "Females 15-49").female(),
        ])
        .unwrap()
    }

    fn per_pop(value: f64) -> Par {
        Par::PerPopulation(vec![
            Anchors::new(vec![2000.0], vec![value]),
            Anchors::new(vec![2000.0], vec![value]),
        ])
    }

    fn parset(pops: &PopulationSet, growth: f64) -> ParameterSet {
        let mut parset = ParameterSet::new("default", pops);
        parset
            .insert(
                InputKey::new("popsize"),
                Par::PopulationSize {
                    init: vec![5e5, 5e5],
                    growth,
                    t0: 2000.0,
                },
            )
            .unwrap();
        parset.insert(InputKey::new("hivprev"), per_pop(0.05)).unwrap();
        parset.insert(InputKey::new("death"), per_pop(0.012)).unwrap();
        parset.insert(InputKey::new("hivtest"), per_pop(0.2)).unwrap();
        parset
            .insert(InputKey::sub("numacts", "reg"), per_pop(70.0))
            .unwrap();
        parset
            .insert(InputKey::sub("condom", "reg"), per_pop(0.3))
            .unwrap();
        parset
            .insert(
                InputKey::sub("pships", "reg"),
                Par::Matrix(vec![vec![0.0, 1.0], vec![1.0, 0.0]]),
            )
            .unwrap();
        parset
            .insert(
                InputKey::new("numfirstline"),
                Par::Scalar(Anchors::new(vec![2000.0, 2015.0], vec![500.0, 5000.0])),
            )
            .unwrap();
        parset
    }

    fn run(growth: f64) -> SimOutput {
        let pops = popset();
        let parset = parset(&pops, growth);
        let grid = TimeGrid::new(2000.0, 2020.0, 0.1);
        let pars = crate::modelpars::ModelPars::from_parset(&parset, &pops, &grid).unwrap();
        Simulator::new(pars, &pops).unwrap().run().unwrap()
    }

    #[test]
    fn test_nonnegative_everywhere() {
        let out = run(0.02);
        for v in out.people.iter() {
            assert!(*v >= 0.0);
        }
    }

    #[test]
    fn test_prevalence_in_bounds() {
        let out = run(0.02);
        for v in out.prev.iter() {
            assert!(*v >= 0.0 && *v <= 1.0);
        }
        let start = out.allprev[0];
        assert!((start - 0.05).abs() < 0.005);
    }

    #[test]
    fn test_headcount_tracks_popsize() {
        let out = run(0.02);
        let npts = out.tvec.len();
        // With popsize reconciliation enabled, total headcount follows the
        // exponential growth path.
        let total_end: f64 = (0..NSTATES)
            .flat_map(|s| (0..2).map(move |p| (s, p)))
            .map(|(s, p)| out.people[[s, p, npts - 1]])
            .sum();
        let expected = 2.0 * 5e5 * (0.02f64 * 20.0).exp();
        assert!((total_end - expected).abs() / expected < 1e-6);
    }

    #[test]
    fn test_headcount_conserved_without_demography() {
        // Zero growth, zero background death, zero births: headcount moves
        // only between compartments.
        let pops = popset();
        let mut parset = parset(&pops, 0.0);
        parset
            .insert(InputKey::new("death"), per_pop(0.0))
            .unwrap();
        let grid = TimeGrid::new(2000.0, 2005.0, 0.1);
        let pars = crate::modelpars::ModelPars::from_parset(&parset, &pops, &grid).unwrap();
        let out = Simulator::new(pars, &pops).unwrap().run().unwrap();
        let total = |t: usize| -> f64 {
            (0..NSTATES)
                .flat_map(|s| (0..2).map(move |p| (s, p)))
                .map(|(s, p)| out.people[[s, p, t]])
                .sum()
        };
        let first = total(0);
        // HIV deaths still remove people, so totals may only shrink, and the
        // popsize reconciliation replaces them; the reconciled total is flat.
        let last = total(out.tvec.len() - 1);
        assert!((first - last).abs() / first < 1e-6);
    }

    #[test]
    fn test_treatment_reaches_target() {
        let out = run(0.02);
        let npts = out.tvec.len();
        let on_tx1: f64 = (0..NCD4)
            .flat_map(|cd4| (0..2).map(move |p| (cd4, p)))
            .map(|(cd4, p)| out.people[[tx1(cd4), p, npts - 1]])
            .sum();
        // The first-line target at the end of the run is 5000.
        assert!(on_tx1 > 3000.0, "on first-line treatment: {}", on_tx1);
    }

    #[test]
    fn test_deterministic() {
        let a = run(0.02);
        let b = run(0.02);
        assert_eq!(a.people, b.people);
        assert_eq!(a.inci, b.inci);
    }

    #[test]
    fn test_incidence_positive_with_transmission() {
        let out = run(0.02);
        let total_inci: f64 = out.inci.iter().sum();
        assert!(total_inci > 0.0);
    }

    #[test]
    fn test_allocate_treatment_prefers_sicker() {
        let avail = vec![
            vec![100.0, 100.0],
            vec![100.0, 100.0],
            vec![100.0, 100.0],
            vec![100.0, 100.0],
            vec![100.0, 100.0],
            vec![50.0, 150.0],
        ];
        let alloc = allocate_treatment(300.0, &avail, 0, 2);
        // The last (sickest) stage fills first: all 200 available.
        assert!((alloc[5][0] - 50.0).abs() < 1e-9);
        assert!((alloc[5][1] - 150.0).abs() < 1e-9);
        // The remainder lands in the next stage down, split evenly.
        assert!((alloc[4][0] - 50.0).abs() < 1e-9);
        assert!((alloc[4][1] - 50.0).abs() < 1e-9);
        // Nothing for healthier stages.
        assert_eq!(alloc[0][0], 0.0);
    }

    #[test]
    fn test_allocate_treatment_respects_eligibility() {
        let avail = vec![vec![100.0]; NCD4];
        let alloc = allocate_treatment(1000.0, &avail, 3, 1);
        assert_eq!(alloc[0][0], 0.0);
        assert_eq!(alloc[1][0], 0.0);
        assert_eq!(alloc[2][0], 0.0);
        assert!((alloc[3][0] - 100.0).abs() < 1e-9);
    }
}
