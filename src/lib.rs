pub mod configuration;

pub mod learner {
    pub mod learner;
    pub mod learnererror;
    pub mod losscache;
    pub mod lossfunction;
    pub mod learner1d;
    pub mod integratorlearner;
    pub mod balancinglearner;
}

pub mod manager {
    pub mod namedobject;
    pub mod managererror;
    pub mod manager;
}

pub mod math {
    pub mod curve {
        pub mod curve;
        pub mod nonparametriccurve;
    }
    pub mod quadrature {
        pub mod clenshawcurtis;
        pub mod interval;
        pub mod intervaltree;
        pub mod integrate;
    }
}
