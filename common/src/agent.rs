//! Metric-source plugin interface, selected by interface version.

use crate::{
    error::PmError,
    pdu::{
        Desc, InstanceReq, InstanceResult, NameEntry, Pdu, PmId, PmResult, PmnsIds, PmnsNames,
        Profile, Text,
    },
};

/// Operations every agent provides.
pub trait AgentV2 {
    fn profile(&mut self, profile: &Profile) -> Result<(), PmError>;
    fn fetch(&mut self, pmids: &[PmId]) -> Result<PmResult, PmError>;
    fn desc(&mut self, pmid: PmId) -> Result<Desc, PmError>;
    fn instance(&mut self, req: &InstanceReq) -> Result<InstanceResult, PmError>;
    fn text(&mut self, ident: i32, text_type: i32) -> Result<String, PmError>;
}

/// Agents that also serve their part of the metric namespace.
pub trait AgentV4: AgentV2 {
    /// Identifiers for the given metric names.
    fn pmid(&mut self, names: &[String]) -> Result<Vec<PmId>, PmError>;
    /// Every name of one metric.
    fn name(&mut self, pmid: PmId) -> Result<Vec<String>, PmError>;
    /// Immediate children of a namespace node. With `with_status` each entry
    /// reports 1 for a leaf and 0 for an interior node.
    fn children(&mut self, name: &str, with_status: bool) -> Result<Vec<NameEntry>, PmError>;
    /// Every leaf below a namespace node.
    fn traverse(&mut self, name: &str) -> Result<Vec<String>, PmError>;
}

/// A loaded agent, tagged by the interface version it implements.
pub enum AgentInterface {
    V2(Box<dyn AgentV2 + Send>),
    V4(Box<dyn AgentV4 + Send>),
}

impl AgentInterface {
    pub fn version(&self) -> u32 {
        match self {
            AgentInterface::V2(_) => 2,
            AgentInterface::V4(_) => 4,
        }
    }

    /// Answer one request. Profiles are stored without a reply, so `None`
    /// means nothing goes back to the requester.
    pub fn dispatch(&mut self, request: &Pdu) -> Option<Pdu> {
        let reply = match request {
            Pdu::PmnsNames(_) | Pdu::PmnsIds(_) | Pdu::PmnsChild(_) | Pdu::PmnsTraverse(_) => {
                self.namespace(request).map(Some)
            }
            _ => match self {
                AgentInterface::V2(agent) => serve(agent.as_mut(), request),
                AgentInterface::V4(agent) => serve(agent.as_mut(), request),
            },
        };
        match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("agent request {} failed: {}", request.kind(), e);
                Some(Pdu::error(e.code()))
            }
        }
    }

    fn namespace(&mut self, request: &Pdu) -> Result<Pdu, PmError> {
        let AgentInterface::V4(agent) = self else {
            return Err(PmError::NotImplemented);
        };
        match request {
            Pdu::PmnsNames(req) => {
                let names: Vec<String> = req.entries.iter().map(|e| e.name.clone()).collect();
                let ids = agent.pmid(&names)?;
                Ok(Pdu::PmnsIds(PmnsIds {
                    status: ids.len() as i32,
                    ids,
                }))
            }
            Pdu::PmnsIds(req) => {
                let pmid = req
                    .ids
                    .first()
                    .copied()
                    .ok_or_else(|| PmError::Ipc("name lookup without an identifier".into()))?;
                Ok(names_reply(agent.name(pmid)?))
            }
            Pdu::PmnsChild(req) => {
                let entries = agent.children(&req.name, req.subtype != 0)?;
                Ok(Pdu::PmnsNames(PmnsNames { entries }))
            }
            Pdu::PmnsTraverse(req) => Ok(names_reply(agent.traverse(&req.name)?)),
            other => Err(PmError::Ipc(format!("{} is not a namespace request", other.kind()))),
        }
    }
}

fn serve<A: AgentV2 + ?Sized>(agent: &mut A, request: &Pdu) -> Result<Option<Pdu>, PmError> {
    let reply = match request {
        Pdu::Profile(profile) => {
            agent.profile(profile)?;
            return Ok(None);
        }
        Pdu::Fetch(req) => Pdu::Result(agent.fetch(&req.pmids)?),
        Pdu::DescReq(pmid) => Pdu::Desc(agent.desc(*pmid)?),
        Pdu::InstanceReq(req) => Pdu::Instance(agent.instance(req)?),
        Pdu::TextReq(req) => Pdu::Text(Text {
            ident:  req.ident,
            buffer: agent.text(req.ident, req.text_type)?,
        }),
        other => return Err(PmError::Ipc(format!("{} is not an agent request", other.kind()))),
    };
    Ok(Some(reply))
}

fn names_reply(names: Vec<String>) -> Pdu {
    Pdu::PmnsNames(PmnsNames {
        entries: names
            .into_iter()
            .map(|name| NameEntry { name, status: 0 })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{PM_ERR_IPC, PM_ERR_NYI},
        pdu::{
            ErrorPdu, FetchReq, InDom, InsituValue, PmnsChild, PmnsTraverse, TextReq, Timeval,
            ValueList, ValueSet,
        },
    };

    const LOAD: PmId = PmId::new(60, 2, 0);

    #[derive(Default)]
    struct Kernel;

    impl AgentV2 for Kernel {
        fn profile(&mut self, _profile: &Profile) -> Result<(), PmError> {
            Ok(())
        }

        fn fetch(&mut self, pmids: &[PmId]) -> Result<PmResult, PmError> {
            Ok(PmResult {
                timestamp: Timeval { sec: 1, usec: 0 },
                sets:      pmids
                    .iter()
                    .map(|pmid| ValueSet {
                        pmid:   *pmid,
                        status: 1,
                        values: ValueList::Insitu(vec![InsituValue { inst: -1, value: 42 }]),
                    })
                    .collect(),
            })
        }

        fn desc(&mut self, pmid: PmId) -> Result<Desc, PmError> {
            if pmid != LOAD {
                return Err(PmError::Remote(-12357));
            }
            Ok(Desc {
                pmid,
                vtype: 0,
                indom: InDom::NULL,
                sem: 3,
                units: 0,
            })
        }

        fn instance(&mut self, req: &InstanceReq) -> Result<InstanceResult, PmError> {
            Ok(InstanceResult {
                indom:     req.indom,
                instances: Vec::new(),
            })
        }

        fn text(&mut self, _ident: i32, _text_type: i32) -> Result<String, PmError> {
            Ok("load average".to_string())
        }
    }

    impl AgentV4 for Kernel {
        fn pmid(&mut self, names: &[String]) -> Result<Vec<PmId>, PmError> {
            Ok(names.iter().map(|_| LOAD).collect())
        }

        fn name(&mut self, _pmid: PmId) -> Result<Vec<String>, PmError> {
            Ok(vec!["kernel.all.load".to_string()])
        }

        fn children(&mut self, _name: &str, with_status: bool) -> Result<Vec<NameEntry>, PmError> {
            Ok(vec![NameEntry {
                name:   "load".to_string(),
                status: if with_status { 1 } else { 0 },
            }])
        }

        fn traverse(&mut self, _name: &str) -> Result<Vec<String>, PmError> {
            Ok(vec!["kernel.all.load".to_string()])
        }
    }

    #[test]
    fn v2_agent_serves_core_requests() {
        let mut agent = AgentInterface::V2(Box::new(Kernel::default()));
        assert_eq!(agent.version(), 2);

        let reply = agent.dispatch(&Pdu::Fetch(FetchReq {
            ctx:   0,
            when:  Timeval::default(),
            pmids: vec![LOAD],
        }));
        assert!(matches!(reply, Some(Pdu::Result(r)) if r.sets.len() == 1));

        let reply = agent.dispatch(&Pdu::TextReq(TextReq {
            ident:     LOAD.raw() as i32,
            text_type: 1,
        }));
        assert!(matches!(reply, Some(Pdu::Text(t)) if t.buffer == "load average"));

        let profile = Profile {
            ctx:      0,
            state:    0,
            profiles: Vec::new(),
        };
        assert_eq!(agent.dispatch(&Pdu::Profile(profile)), None);
    }

    #[test]
    fn v2_agent_has_no_namespace() {
        let mut agent = AgentInterface::V2(Box::new(Kernel::default()));
        let reply = agent.dispatch(&Pdu::PmnsTraverse(PmnsTraverse {
            subtype: 0,
            name:    "kernel".to_string(),
        }));
        assert_eq!(
            reply,
            Some(Pdu::Error(ErrorPdu {
                code:  PM_ERR_NYI,
                datum: None,
            }))
        );
    }

    #[test]
    fn v4_agent_serves_namespace() {
        let mut agent = AgentInterface::V4(Box::new(Kernel::default()));
        let reply = agent.dispatch(&Pdu::PmnsChild(PmnsChild {
            subtype: 1,
            name:    "kernel.all".to_string(),
        }));
        let Some(Pdu::PmnsNames(names)) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(names.entries[0].status, 1);

        let reply = agent.dispatch(&Pdu::PmnsIds(PmnsIds {
            status: 1,
            ids:    vec![LOAD],
        }));
        assert!(matches!(reply, Some(Pdu::PmnsNames(n)) if n.entries[0].name == "kernel.all.load"));
    }

    #[test]
    fn agent_errors_become_error_pdus() {
        let mut agent = AgentInterface::V4(Box::new(Kernel::default()));
        let reply = agent.dispatch(&Pdu::DescReq(PmId::new(1, 1, 1)));
        assert_eq!(reply, Some(Pdu::error(-12357)));

        let reply = agent.dispatch(&Pdu::error(0));
        assert_eq!(reply, Some(Pdu::error(PM_ERR_IPC)));
    }
}
